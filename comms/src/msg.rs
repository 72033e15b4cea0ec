use std::{borrow::Cow, io};

use crate::{Deserialize, Serialize};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

const ERR_KIND: Header = 0;
const CONTROL_KIND: Header = 1;
const DATA_KIND: Header = 2;

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// First message a non-root rank sends after connecting to the root.
    Join { task_id: usize, world_size: usize },
    Disconnect,
}

/// The application layer message exchanged between workers.
#[derive(Debug)]
pub enum Msg<'a> {
    Control(Command),
    /// Raw little endian bytes of a contiguous slice of numbers.
    Data(&'a [u8]),
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    /// A short name for the kind of message, used in logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Control(Command::Join { .. }) => "control/join",
            Msg::Control(Command::Disconnect) => "control/disconnect",
            Msg::Data(_) => "data",
            Msg::Err(_) => "err",
        }
    }
}

fn invalid_data<T>(detail: String) -> io::Result<T> {
    Err(io::Error::new(io::ErrorKind::InvalidData, detail))
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&ERR_KIND.to_be_bytes());
                Some(e.as_bytes())
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&CONTROL_KIND.to_be_bytes());

                // `Command` derives its serde impl and has no maps, so encoding into a
                // `Vec` cannot fail.
                if let Err(e) = serde_json::to_writer(&mut *buf, cmd) {
                    log::error!("failed to encode control message: {e}");
                }
                None
            }
            Msg::Data(bytes) => {
                buf.extend_from_slice(&DATA_KIND.to_be_bytes());
                Some(*bytes)
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self> {
        let Some((kind, rest)) = buf.split_first_chunk::<HEADER_SIZE>() else {
            return invalid_data(format!(
                "frame of {} bytes is shorter than the {HEADER_SIZE} bytes header",
                buf.len()
            ));
        };

        match Header::from_be_bytes(*kind) {
            ERR_KIND => {
                let detail = std::str::from_utf8(rest)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Msg::Err(Cow::Borrowed(detail)))
            }
            CONTROL_KIND => Ok(Msg::Control(serde_json::from_slice(rest)?)),
            DATA_KIND => Ok(Msg::Data(rest)),
            other => invalid_data(format!("received an invalid kind header {other}")),
        }
    }
}
