//! Service layer exposed to transports (HTTP, user events)

pub mod segmentation;
pub mod users;

pub use segmentation::SegmentationService;
pub use users::UsersService;
