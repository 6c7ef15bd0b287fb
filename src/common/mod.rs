mod contact;
mod id;
mod messages;
mod routing_table;
mod value;

pub use contact::*;
pub use id::*;
pub use messages::*;
pub use routing_table::*;
pub use value::*;
