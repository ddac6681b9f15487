//! Queue building blocks shared by the throttle and the bridges.

mod intrusive_list;
pub use intrusive_list::{Cursor, ElementHandle, IntrusiveList, ListGuard, ListOptions};
