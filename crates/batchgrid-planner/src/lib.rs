//! batchgrid-planner: sizes and times one batch against one target.
//!
//! ```text
//! TargetSnapshot + ActorCapability
//!   │
//!   ├── plan_target()      → BatchPlan (threads per group, durations, RAM)
//!   │     ├── plan_prep()  when defense or value is off its floor
//!   │     └── plan_batch() otherwise
//!   │
//!   └── schedule_cycle()   → CycleSchedule (start delay per group)
//!         └── serialize_cycle() when the overlapped timing is infeasible
//! ```

pub mod cycle;
pub mod error;
pub mod planner;

pub use cycle::{Anchor, anchor_after, CycleSchedule, GroupTiming, landing_order, schedule_cycle, schedule_or_serialize, serialize_cycle};
pub use error::{PlanError, PlanResult};
pub use planner::{BatchPlan, OperationDurations, PlanParams, plan_batch, plan_prep, plan_target};
