//! Abstract executor capability.
//!
//! The session never spawns threads of its own; every deferred piece of work
//! goes through one of three lanes. An implementation may collapse the lanes
//! into a single queue, but must preserve submission order within each lane.
//! Posted tasks may run on any thread and may outlive the submitter.

/// Allocation-owning closure submitted to an event processor.
pub type Task = Box<dyn FnOnce() + Send>;

/// Three-lane executor capability consumed by sessions.
pub trait EventProc: Send + Sync {
    /// RPC reply completions. Lowest priority.
    fn post_rpc_completion(&self, task: Task) {
        self.post_internal_message(task);
    }

    /// Remote-invoked service handlers. Medium priority.
    fn post_handler_callback(&self, task: Task) {
        self.post_internal_message(task);
    }

    /// Receive driver and cancellation work. Highest priority.
    fn post_internal_message(&self, task: Task);
}
