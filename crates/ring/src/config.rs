//! Ring topology configuration

use ringlm_protocol::constants::{DEFAULT_DATA_PORT, DEFAULT_SIGNAL_PORT};

/// Where this node sits in the ring and how to reach its neighbour
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// This node's rank; 0 is the head
    pub rank: usize,
    /// Cluster size
    pub n_world: usize,
    /// Address to bind the ingress listeners on
    pub bind_ip: String,
    /// Address of rank `(rank + 1) % n_world`
    pub next_node_ip: String,
    /// Activation link port
    pub data_port: u16,
    /// Control link port
    pub signal_port: u16,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            rank: 0,
            n_world: 1,
            bind_ip: "0.0.0.0".to_string(),
            next_node_ip: "127.0.0.1".to_string(),
            data_port: DEFAULT_DATA_PORT,
            signal_port: DEFAULT_SIGNAL_PORT,
        }
    }
}

impl RingConfig {
    /// Whether this node is the head
    pub fn is_head(&self) -> bool {
        self.rank == 0
    }

    /// Whether the ring has any remote hops at all
    pub fn is_distributed(&self) -> bool {
        self.n_world > 1
    }

    pub fn data_bind_addr(&self) -> String {
        format!("{}:{}", self.bind_ip, self.data_port)
    }

    pub fn signal_bind_addr(&self) -> String {
        format!("{}:{}", self.bind_ip, self.signal_port)
    }

    pub fn next_data_addr(&self) -> String {
        format!("{}:{}", self.next_node_ip, self.data_port)
    }

    pub fn next_signal_addr(&self) -> String {
        format!("{}:{}", self.next_node_ip, self.signal_port)
    }
}
