//! Small shared utilities: the intrusive list (spec component B) and the
//! mutex-guarded FIFO the scheduler's handler queue is built on.

pub mod fifo;
pub mod intrusive_list;

pub use fifo::Fifo;
pub use intrusive_list::{IntrusiveList, Link, Node};
