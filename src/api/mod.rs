/// HTTP API layer
///
/// REST endpoints for flow registration, execution, trigger firing,
/// deploy/undeploy, test-mode lifecycle, and script validation.

pub mod flows;

pub use flows::create_flow_routes;
