//! Status to handler dispatch table, built once at startup.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::handlers::{
    ChainStateHandler, HandlerContext, QueuedHandler, ResubmitHandler, StatusHandler,
};
use crate::domain::TransactionStatus;

#[derive(Default, Clone)]
pub struct StatusHandlerRegistry {
    handlers: BTreeMap<TransactionStatus, Arc<dyn StatusHandler>>,
}

impl StatusHandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The full recovery table used by the observer
    #[must_use]
    pub fn standard(ctx: HandlerContext) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(QueuedHandler::new(ctx.clone())));
        registry.register(Arc::new(ChainStateHandler::submitted(ctx.clone())));
        registry.register(Arc::new(ChainStateHandler::unknown(ctx.clone())));
        registry.register(Arc::new(ResubmitHandler::geth_down(ctx.clone())));
        for status in [
            TransactionStatus::InsufficientGas,
            TransactionStatus::NonceTooLow,
            TransactionStatus::ReplacementTxUnderPriced,
        ] {
            registry.register(Arc::new(ResubmitHandler::rejected(ctx.clone(), status)));
        }
        registry
    }

    /// Register under the handler's own status, replacing any previous handler
    pub fn register(&mut self, handler: Arc<dyn StatusHandler>) -> &mut Self {
        self.handlers.insert(handler.status(), handler);
        self
    }

    pub fn get(&self, status: TransactionStatus) -> Option<Arc<dyn StatusHandler>> {
        self.handlers.get(&status).cloned()
    }

    /// Statuses the scheduler claims, in stable order
    pub fn monitored_statuses(&self) -> Vec<TransactionStatus> {
        self.handlers.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::Harness;

    #[test]
    fn test_standard_registry_covers_recoverable_statuses() {
        let harness = Harness::new();
        let registry = StatusHandlerRegistry::standard(harness.context());

        let monitored = registry.monitored_statuses();
        assert_eq!(
            monitored,
            vec![
                TransactionStatus::Queued,
                TransactionStatus::Submitted,
                TransactionStatus::Unknown,
                TransactionStatus::GethDown,
                TransactionStatus::InsufficientGas,
                TransactionStatus::NonceTooLow,
                TransactionStatus::ReplacementTxUnderPriced,
            ]
        );
        for status in monitored {
            assert_eq!(registry.get(status).unwrap().status(), status);
        }
        assert!(registry.get(TransactionStatus::Mined).is_none());
        assert!(registry.get(TransactionStatus::Failed).is_none());
        assert!(registry.get(TransactionStatus::Processing).is_none());
    }

    #[test]
    fn test_register_replaces_existing_handler() {
        let harness = Harness::new();
        let mut registry = StatusHandlerRegistry::new();
        assert!(registry.is_empty());

        registry.register(Arc::new(QueuedHandler::new(harness.context())));
        registry.register(Arc::new(QueuedHandler::new(harness.context())));
        assert_eq!(registry.monitored_statuses(), vec![TransactionStatus::Queued]);
    }
}
