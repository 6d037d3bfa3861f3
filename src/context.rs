use std::sync::Arc;

use crate::error::Result;
use crate::{GraphClient, Settings, SubscriptionManager, TokenProvider, WorkflowForwarder};

/// Process-owned collaborators, shared across request threads.
pub(crate) struct AppContext {
    pub(crate) settings: Settings,
    pub(crate) graph: Arc<GraphClient>,
    pub(crate) subscriptions: SubscriptionManager,
    pub(crate) forwarder: WorkflowForwarder,
}

impl AppContext {
    pub(crate) fn new(settings: Settings) -> Result<Self> {
        let tokens = Arc::new(TokenProvider::new(&settings.graph)?);
        let graph = Arc::new(GraphClient::new(&settings.graph, tokens));
        let subscriptions = SubscriptionManager::new(Arc::clone(&graph), settings.webhook.clone());
        let forwarder = WorkflowForwarder::new(&settings.workflow);
        Ok(Self {
            settings,
            graph,
            subscriptions,
            forwarder,
        })
    }
}
