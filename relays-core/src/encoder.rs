//! Pure transformations from an [`Event`](crate::event::Event) to the payload of a sink.

pub mod line;
pub mod nora;
pub mod vera;
