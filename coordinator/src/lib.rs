// Session store (tasks, messages, agents, locks)
pub mod store;

// Dependency resolution over task graphs
pub mod resolver;

// Agent messaging and registry
pub mod mailbox;

// Named-resource lock manager
pub mod locks;

// Run configuration
pub mod config;

// Worker loop
pub mod worker;

// Supervisor orchestration
pub mod supervisor;

// Built-in decomposer/executor/synthesizer implementations
pub mod executors;

pub use coordinator_sdk as sdk;
