pub mod broker_hub;

pub use broker_hub::{decode_payload, BrokerHub, Handler};
