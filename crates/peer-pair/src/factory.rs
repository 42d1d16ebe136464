use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::PairConfig;
use crate::endpoint::Endpoint;
use crate::error::PairError;

/// Two freshly constructed endpoints plus anything that must outlive them,
/// such as a virtual network router.
pub struct EndpointPair<E> {
    pub endpoints: [Arc<E>; 2],
    pub keepalive: Option<Box<dyn Any + Send + Sync>>,
}

impl<E> EndpointPair<E> {
    pub fn new(endpoints: [Arc<E>; 2]) -> Self {
        Self {
            endpoints,
            keepalive: None,
        }
    }

    pub fn with_keepalive(mut self, keepalive: impl Any + Send + Sync) -> Self {
        self.keepalive = Some(Box::new(keepalive));
        self
    }
}

/// Builds the endpoints a session negotiates between.
#[async_trait]
pub trait EndpointFactory<E: Endpoint>: Send + Sync {
    async fn create_pair(&self, config: &PairConfig) -> Result<EndpointPair<E>, PairError>;
}
