//! Privilege transition gate.
//!
//! A closed table of `(command pattern, invoker, target)` rules. Anything
//! not matched is denied, and no default-allow path exists.

mod gate;
mod rules;

pub use gate::PrivilegeGate;
pub use rules::{
    AllowList, ArgPattern, CommandPattern, PrivilegeRule, PrivilegedCommand, ELEVATION_TOOLS, ROOT,
};
