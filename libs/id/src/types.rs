//! Typed ID definitions.

use crate::define_id;

define_id!(NodeId, "node");
define_id!(InstanceId, "inst");
define_id!(BindingId, "bind");
define_id!(HandleId, "hdl");
