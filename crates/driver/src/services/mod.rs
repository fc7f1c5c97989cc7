// Services layer
//
// Each service owns one role this process can play. The same process may be a
// driver node, a run host, the stats host and a controller owner at once.

pub mod controller;
pub mod node;
pub mod run;

use std::sync::Arc;

use rampart_core::{DryRunExecutor, OperationExecutor, PeerClient, StatsAggregator, TransportError};

pub use controller::ControllerService;
pub use node::NodeService;
pub use run::RunService;

use crate::config::DriverConfig;

/// Every service of one driver process
#[derive(Clone)]
pub struct Services {
    pub nodes: Arc<NodeService>,
    pub runs: Arc<RunService>,
    pub controllers: Arc<ControllerService>,
    pub aggregator: Arc<StatsAggregator>,
}

impl Services {
    /// Services driving operations through the built-in dry-run executor
    pub fn new(config: &DriverConfig) -> Result<Self, TransportError> {
        let executor = Arc::new(DryRunExecutor::new(config.dry_run_service_time));
        Self::with_executor(config, executor)
    }

    pub fn with_executor(
        config: &DriverConfig,
        executor: Arc<dyn OperationExecutor>,
    ) -> Result<Self, TransportError> {
        let client = PeerClient::new(config.http_timeout, config.peer_port)?;
        let self_host = config.self_host();

        let aggregator = Arc::new(StatsAggregator::new());
        let controllers = Arc::new(ControllerService::new(client.clone(), &self_host));
        let runs = Arc::new(RunService::new(
            client.clone(),
            &self_host,
            aggregator.clone(),
            controllers.clone(),
        ));
        let nodes = Arc::new(NodeService::new(client, executor, config.exit_on_shutdown));

        Ok(Self {
            nodes,
            runs,
            controllers,
            aggregator,
        })
    }
}
