pub mod errors;
pub mod config;
pub mod model;
pub mod persister;
pub mod portal;
pub mod twopc;
pub mod operation;
pub mod consolidator;
pub mod executor;
pub mod branch;
pub mod coordinator;
pub mod wait_chain;
pub mod transaction;
pub mod nested;
mod thoth;

// Re-export key types and structs for easier access
pub use errors::{Result, ThothError};
pub use config::{ConsolidationConfig, CoordinatorKind, ThothConfig};
pub use consolidator::OperationBuffer;
pub use coordinator::{
    CompletionStatus, LocalCoordinator, Synchronization, ThreadedCoordinator,
    TransactionCoordinator, TransactionState,
};
pub use executor::{PendingResult, SerialExecutor};
pub use model::{AttributeUpdate, ObjectKey, ObjectRef, TransactionalObject, Value};
pub use nested::NestedTransaction;
pub use operation::{Operation, OperationKind, PassThroughDirection};
pub use persister::{Cache, ExecutionContext, Persister, UpdateCountHolder};
pub use portal::{Portal, Predicate};
pub use thoth::{Thoth, prelude};
pub use transaction::{LifecycleListener, RootTransaction};
pub use twopc::{BranchId, EndFlag, PrepareVote, ResourceError, ResourceManager, StartFlag};
pub use wait_chain::{ThreadLiveness, WaitChain};
