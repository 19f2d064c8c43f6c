//! Terminal forward channel: each frame is printed as one line of hex.
//!
//! Stands in for a QR display and camera when both ends are shells, e.g.
//! `qrlink send a b | qrlink receive`.

use std::convert::Infallible;

use qrlink_core::charset;
use qrlink_core::{ForwardChannel, Frame};

#[derive(Debug, Default, Clone, Copy)]
pub struct HexLineChannel;

impl ForwardChannel for HexLineChannel {
    type Image = String;
    type Error = Infallible;

    fn encode(&self, frame: &Frame) -> Result<String, Infallible> {
        Ok(hex::encode(frame.to_bytes()))
    }

    fn decode(&self, image: &String) -> Option<String> {
        let bytes = hex::decode(image.trim()).ok()?;
        Some(charset::from_latin1_bytes(&bytes))
    }
}
