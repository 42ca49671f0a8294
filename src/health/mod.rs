pub mod checkers;
pub mod supervisor;

pub use checkers::{
    CacheChecker, CompositeChecker, DatabaseChecker, DependencyChecker, HealthCheckResult,
    HealthChecker, HttpChecker, InMemoryKeyValueStore, KeyValueStore, LoadBalancerChecker,
    PoolStats, run_checker,
};
pub use supervisor::{ServiceState, Supervisor, SupervisorBuilder, SupervisorConfig};
