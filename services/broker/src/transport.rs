use comet_transport::TransportConfig;

use crate::config::BrokerConfig;

pub mod tcp;

pub fn tcp_transport_config(config: &BrokerConfig, mut base: TransportConfig) -> TransportConfig {
    base.max_frame_bytes = config.max_frame_bytes;
    base
}
