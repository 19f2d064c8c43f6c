//! Forward channel seam: the sender renders frames into something scannable,
//! the receiver turns scans back into text. Rendering itself (QR bitmaps,
//! camera pipelines) lives outside this crate.

use crate::frame::Frame;

pub trait ForwardChannel {
    /// What the sender shows: a bitmap, a terminal line, ...
    type Image;
    type Error: std::error::Error + Send + Sync + 'static;

    fn encode(&self, frame: &Frame) -> Result<Self::Image, Self::Error>;

    /// `None` when the scan did not yield text (blurred, partial, not a code).
    fn decode(&self, image: &Self::Image) -> Option<String>;
}
