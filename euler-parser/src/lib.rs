pub mod attrs;
pub mod compiler;
pub mod errors;
pub mod gen_io;
pub mod optimizer;
pub mod translator;
pub mod tree;

pub use compiler::Compiler;
pub use errors::CompileError;
pub use translator::{IndexInfo, Mode, Translator};
