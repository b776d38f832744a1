//! Cluster-facing client state: one retrying client per shard, plus the
//! aggregated cluster metadata (labels, weight tables, index info) the
//! compiler and the weighted split kernels feed on.

use std::collections::BTreeSet;
use std::sync::Arc;

use euler_core::env::ShardWeights;
use euler_core::ShardClients;
use euler_types::errors::Status;
use euler_types::grpc::{ExecuteReply, ExecuteRequest};
use euler_types::models::ClientOptions;
use euler_types::tonic;
use euler_types::tracing::info;

use crate::errors::ClientError;
use crate::rpc_client::RpcClient;
use crate::server_monitor::ServerMonitor;

pub struct ClientManager {
    clients: Vec<Arc<RpcClient>>,
    graph_label: Vec<String>,
    shard_weights: ShardWeights,
    index_info: String,
}

fn parse_weight_row(shard: usize, value: &str) -> Result<Vec<f32>, ClientError> {
    value
        .split(',')
        .map(|w| {
            w.trim()
                .parse::<f32>()
                .map_err(|_| ClientError::InvalidWeightMeta {
                    shard,
                    value: value.to_string(),
                })
        })
        .collect()
}

/// Collects one weight table across shards: rows are types, columns are
/// shards; a per-shard totals row and a per-type totals column are
/// appended for the weighted shard samplers. Misaligned per-type vectors
/// are rejected.
fn collect_weights(
    monitor: &Arc<dyn ServerMonitor>,
    key: &str,
    shard_num: usize,
) -> Result<Vec<Vec<f32>>, ClientError> {
    let mut table: Vec<Vec<f32>> = Vec::new();
    let mut num_types: Option<usize> = None;
    for shard in 0..shard_num {
        let value = monitor
            .get_shard_meta(shard, key)
            .ok_or_else(|| ClientError::MissingMeta(format!("{key} (shard {shard})")))?;
        let weights = parse_weight_row(shard, &value)?;
        match num_types {
            None => {
                num_types = Some(weights.len());
                table = vec![vec![0.0; shard_num + 1]; weights.len() + 1];
            }
            Some(expected) if expected != weights.len() => {
                return Err(ClientError::MisalignedWeights {
                    shard,
                    expected,
                    actual: weights.len(),
                });
            }
            Some(_) => {}
        }
        for (type_idx, weight) in weights.iter().enumerate() {
            table[type_idx][shard] = *weight;
        }
    }
    // Totals: last column per type, last row per shard, grand total in the
    // corner.
    let num_types = num_types.unwrap_or(0);
    for type_idx in 0..num_types {
        let row_sum: f32 = table[type_idx][..shard_num].iter().sum();
        table[type_idx][shard_num] = row_sum;
    }
    for shard in 0..=shard_num {
        let column_sum: f32 = (0..num_types).map(|t| table[t][shard]).sum();
        table[num_types][shard] = column_sum;
    }
    Ok(table)
}

impl ClientManager {
    pub fn new(
        monitor: Arc<dyn ServerMonitor>,
        options: &ClientOptions,
    ) -> Result<Self, ClientError> {
        let shard_num = options.shard_num.max(1);
        let mut clients = Vec::with_capacity(shard_num);
        for shard in 0..shard_num {
            clients.push(Arc::new(RpcClient::connect(
                monitor.clone(),
                shard,
                options,
            )?));
        }

        let index_info = monitor.get_meta("index_info").unwrap_or_default();

        let mut labels = BTreeSet::new();
        for shard in 0..shard_num {
            if let Some(value) = monitor.get_shard_meta(shard, "graph_label") {
                labels.extend(
                    value
                        .split(',')
                        .filter(|l| !l.is_empty())
                        .map(str::to_string),
                );
            }
        }
        let graph_label: Vec<String> = labels.into_iter().collect();
        for label in &graph_label {
            info!(label, "graph label");
        }

        let shard_weights = ShardWeights {
            node: collect_weights(&monitor, "node_sum_weight", shard_num)?,
            edge: collect_weights(&monitor, "edge_sum_weight", shard_num)?,
        };

        Ok(Self {
            clients,
            graph_label,
            shard_weights,
            index_info,
        })
    }

    pub fn client(&self, shard: usize) -> Result<&Arc<RpcClient>, ClientError> {
        self.clients
            .get(shard)
            .ok_or(ClientError::ShardOutOfRange(shard))
    }

    pub fn graph_label(&self) -> &[String] {
        &self.graph_label
    }

    pub fn shard_weights(&self) -> &ShardWeights {
        &self.shard_weights
    }

    pub fn index_info(&self) -> &str {
        &self.index_info
    }
}

#[tonic::async_trait]
impl ShardClients for ClientManager {
    fn num_shards(&self) -> usize {
        self.clients.len()
    }

    async fn execute(
        &self,
        shard: usize,
        request: ExecuteRequest,
    ) -> Result<ExecuteReply, Status> {
        let client = self
            .clients
            .get(shard)
            .ok_or_else(|| Status::invalid_argument(format!("shard {shard} out of range")))?
            .clone();
        client.execute(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server_monitor::{Meta, ServerRegister, SimpleServerMonitor};

    fn shard_meta(node_weights: &str, edge_weights: &str) -> Meta {
        Meta::from([
            ("graph_label".to_string(), "train,test".to_string()),
            ("node_sum_weight".to_string(), node_weights.to_string()),
            ("edge_sum_weight".to_string(), edge_weights.to_string()),
        ])
    }

    fn global_meta() -> Meta {
        Meta::from([
            ("num_shards".to_string(), "2".to_string()),
            ("index_info".to_string(), "price:range_index".to_string()),
        ])
    }

    #[test]
    fn aggregates_weights_with_totals() {
        let monitor = SimpleServerMonitor::new();
        monitor.register_shard(0, &"h0:1".to_string(), global_meta(), shard_meta("1,2", "4"));
        monitor.register_shard(1, &"h1:1".to_string(), global_meta(), shard_meta("3,4", "6"));
        let options = ClientOptions {
            shard_num: 2,
            ..ClientOptions::default()
        };
        let dyn_monitor: Arc<dyn ServerMonitor> = monitor;
        let manager = ClientManager::new(dyn_monitor, &options).unwrap();

        // Rows: type 0, type 1, totals; columns: shard 0, shard 1, total.
        assert_eq!(
            manager.shard_weights().node,
            vec![
                vec![1.0, 3.0, 4.0],
                vec![2.0, 4.0, 6.0],
                vec![3.0, 7.0, 10.0],
            ]
        );
        assert_eq!(manager.shard_weights().edge, vec![vec![4.0, 6.0, 10.0], vec![4.0, 6.0, 10.0]]);
        assert_eq!(manager.graph_label(), &["test", "train"]);
        assert_eq!(manager.index_info(), "price:range_index");
        assert_eq!(manager.num_shards(), 2);
    }

    #[test]
    fn misaligned_weight_vectors_are_rejected() {
        let monitor = SimpleServerMonitor::new();
        monitor.register_shard(0, &"h0:1".to_string(), global_meta(), shard_meta("1,2", "4"));
        monitor.register_shard(1, &"h1:1".to_string(), global_meta(), shard_meta("3", "6"));
        let options = ClientOptions {
            shard_num: 2,
            ..ClientOptions::default()
        };
        let dyn_monitor: Arc<dyn ServerMonitor> = monitor;
        let err = match ClientManager::new(dyn_monitor, &options) {
            Err(e) => e,
            Ok(_) => panic!("expected ClientManager::new to fail"),
        };
        assert!(matches!(err, ClientError::MisalignedWeights { .. }));
    }
}
