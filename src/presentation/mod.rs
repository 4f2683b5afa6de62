pub mod holder;

pub use holder::{
    DisclosureRequest, ParsedRequest, PermittedItems, PreparedDeviceResponse, ResponseOutcome,
};
