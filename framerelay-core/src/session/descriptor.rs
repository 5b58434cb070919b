//! SDP session descriptor builder
//!
//! The input transcoder is pointed at a descriptor file instead of a raw RTP
//! URL so it knows the codec, payload type and geometry before the first
//! packet arrives. The descriptor is regenerated on every pipeline start
//! because ports and addresses may change between attempts.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::{FrameFormat, SessionConfig};

/// Errors that can occur while producing the descriptor artifact
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("Cannot write session descriptor to {path}: {source}")]
    Unwritable {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Media direction attribute of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    SendOnly,
    ReceiveOnly,
    SendReceive,
}

impl Direction {
    /// SDP attribute value for this direction
    pub fn attribute(&self) -> &'static str {
        match self {
            Direction::SendOnly => "sendonly",
            Direction::ReceiveOnly => "recvonly",
            Direction::SendReceive => "sendrecv",
        }
    }
}

/// Immutable description of one video session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    pub session_name: String,
    pub address: String,
    pub port: u16,
    pub payload_type: u8,
    pub codec_name: String,
    pub clock_rate: u32,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub direction: Direction,
}

impl SessionDescriptor {
    /// Builds the descriptor from session and frame configuration.
    pub fn new(session: &SessionConfig, frame: &FrameFormat) -> Self {
        Self {
            session_name: session.session_name.clone(),
            address: session.address.clone(),
            port: session.port,
            payload_type: session.payload_type,
            codec_name: session.codec_name.clone(),
            clock_rate: session.clock_rate,
            width: frame.width,
            height: frame.height,
            frame_rate: frame.frame_rate,
            direction: session.direction,
        }
    }

    /// Builds the descriptor and writes it to the configured path.
    ///
    /// # Errors
    ///
    /// - `DescriptorError::Unwritable` - Target location cannot be written
    pub fn build(session: &SessionConfig, frame: &FrameFormat) -> Result<Self, DescriptorError> {
        let descriptor = Self::new(session, frame);
        descriptor.write_to(&session.descriptor_path)?;
        Ok(descriptor)
    }

    /// Renders the SDP document.
    pub fn render(&self) -> String {
        let address_type = if self.address.contains(':') {
            "IP6"
        } else {
            "IP4"
        };

        let mut sdp = String::with_capacity(256);
        // Writing into a String cannot fail
        let _ = write!(
            sdp,
            "v=0\r\n\
             o=- 0 0 IN {address_type} {address}\r\n\
             s={name}\r\n\
             c=IN {address_type} {address}\r\n\
             t=0 0\r\n\
             m=video {port} RTP/AVP {pt}\r\n\
             a=rtpmap:{pt} {codec}/{clock}\r\n\
             a=framesize:{pt} {width}-{height}\r\n\
             a=framerate:{fps}\r\n\
             a={direction}\r\n",
            address = self.address,
            name = self.session_name,
            port = self.port,
            pt = self.payload_type,
            codec = self.codec_name,
            clock = self.clock_rate,
            width = self.width,
            height = self.height,
            fps = self.frame_rate,
            direction = self.direction.attribute(),
        );
        sdp
    }

    /// Writes the rendered document to `path`, replacing any previous one.
    ///
    /// The document is written next to the target first and renamed into
    /// place so a transcoder never observes a half-written descriptor.
    ///
    /// # Errors
    ///
    /// - `DescriptorError::Unwritable` - Directory or file cannot be written
    pub fn write_to(&self, path: &Path) -> Result<(), DescriptorError> {
        let unwritable = |source| DescriptorError::Unwritable {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(unwritable)?;
        }

        let mut staging = path.as_os_str().to_owned();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);

        std::fs::write(&staging, self.render()).map_err(unwritable)?;
        std::fs::rename(&staging, path).map_err(unwritable)?;

        tracing::debug!(
            path = %path.display(),
            port = self.port,
            payload_type = self.payload_type,
            "Wrote session descriptor"
        );
        Ok(())
    }
}
