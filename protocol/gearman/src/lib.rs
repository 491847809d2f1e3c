//! Gearman binary wire protocol.
//!
//! Every packet starts with a 12-byte big-endian header:
//!
//! ```text
//! +----------+----------+----------+
//! |  magic   | command  | body len |
//! | 4 bytes  | 4 bytes  | 4 bytes  |
//! +----------+----------+----------+
//! ```
//!
//! The magic is `\0REQ` for requests and `\0RES` for responses. The body
//! holds a fixed, command-specific number of arguments separated by NUL
//! bytes; the final argument runs to the end of the body and may itself
//! contain NULs (this is how opaque job payloads are carried).
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use protocol_gearman::{Command, Packet};
//!
//! let mut buf = BytesMut::new();
//! Packet::request(Command::EchoReq, &[b"hello"]).encode(&mut buf);
//!
//! let (packet, consumed) = Packet::parse(&buf).unwrap();
//! assert_eq!(consumed, buf.len());
//! assert_eq!(packet.command, Command::EchoReq);
//! assert_eq!(packet.arg(0), Some(&b"hello"[..]));
//! ```

use bytes::{Bytes, BytesMut};

/// Length of the fixed packet header.
pub const HEADER_LEN: usize = 12;

/// Upper bound on the body length accepted from the wire.
///
/// Anything larger is treated as a protocol violation rather than an
/// allocation request.
pub const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

const REQ_MAGIC: &[u8; 4] = b"\0REQ";
const RES_MAGIC: &[u8; 4] = b"\0RES";

/// Parse error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Need more data to complete parsing.
    #[error("incomplete")]
    Incomplete,
    /// First four bytes are neither `\0REQ` nor `\0RES`.
    #[error("invalid packet magic")]
    InvalidMagic,
    /// Header carries a command number this implementation does not know.
    #[error("unknown command {0}")]
    UnknownCommand(u32),
    /// Body length exceeds [`MAX_BODY_LEN`].
    #[error("packet body of {0} bytes exceeds limit")]
    TooLarge(usize),
    /// Body does not split into the argument count the command requires.
    #[error("malformed {0} arguments")]
    MalformedArgs(&'static str),
}

/// Packet direction, encoded in the magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Magic {
    #[default]
    Request,
    Response,
}

impl Magic {
    fn as_bytes(self) -> &'static [u8; 4] {
        match self {
            Magic::Request => REQ_MAGIC,
            Magic::Response => RES_MAGIC,
        }
    }
}

macro_rules! commands {
    ($(($variant:ident, $num:literal, $name:literal, $args:literal),)+) => {
        /// Protocol command numbers.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum Command {
            $($variant = $num,)+
        }

        impl Command {
            /// Look up a command by its wire number.
            pub fn from_u32(num: u32) -> Option<Command> {
                match num {
                    $($num => Some(Command::$variant),)+
                    _ => None,
                }
            }

            /// Wire name of the command.
            pub fn name(self) -> &'static str {
                match self {
                    $(Command::$variant => $name,)+
                }
            }

            /// Number of NUL-separated arguments the command carries.
            pub fn arg_count(self) -> usize {
                match self {
                    $(Command::$variant => $args,)+
                }
            }
        }
    };
}

commands! {
    (CanDo, 1, "CAN_DO", 1),
    (CantDo, 2, "CANT_DO", 1),
    (ResetAbilities, 3, "RESET_ABILITIES", 0),
    (PreSleep, 4, "PRE_SLEEP", 0),
    (Noop, 6, "NOOP", 0),
    (SubmitJob, 7, "SUBMIT_JOB", 3),
    (JobCreated, 8, "JOB_CREATED", 1),
    (GrabJob, 9, "GRAB_JOB", 0),
    (NoJob, 10, "NO_JOB", 0),
    (JobAssign, 11, "JOB_ASSIGN", 3),
    (WorkStatus, 12, "WORK_STATUS", 3),
    (WorkComplete, 13, "WORK_COMPLETE", 2),
    (WorkFail, 14, "WORK_FAIL", 1),
    (GetStatus, 15, "GET_STATUS", 1),
    (EchoReq, 16, "ECHO_REQ", 1),
    (EchoRes, 17, "ECHO_RES", 1),
    (SubmitJobBg, 18, "SUBMIT_JOB_BG", 3),
    (Error, 19, "ERROR", 2),
    (StatusRes, 20, "STATUS_RES", 5),
    (SetClientId, 22, "SET_CLIENT_ID", 1),
}

// Default is only meaningful for pooled packet objects awaiting reuse.
impl Default for Command {
    fn default() -> Self {
        Command::Noop
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded (or to-be-encoded) protocol packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    pub magic: Magic,
    pub command: Command,
    pub args: Vec<Bytes>,
}

impl Packet {
    /// Build a request packet from argument slices.
    pub fn request(command: Command, args: &[&[u8]]) -> Packet {
        Self::build(Magic::Request, command, args)
    }

    /// Build a response packet from argument slices.
    pub fn response(command: Command, args: &[&[u8]]) -> Packet {
        Self::build(Magic::Response, command, args)
    }

    fn build(magic: Magic, command: Command, args: &[&[u8]]) -> Packet {
        debug_assert_eq!(args.len(), command.arg_count());
        Packet {
            magic,
            command,
            args: args.iter().map(|a| Bytes::copy_from_slice(a)).collect(),
        }
    }

    /// Parse one packet from the front of `data`.
    ///
    /// Returns the packet and the number of bytes consumed. Returns
    /// [`ParseError::Incomplete`] when `data` does not yet hold a whole
    /// packet; callers accumulate more bytes and retry.
    pub fn parse(data: &[u8]) -> Result<(Packet, usize), ParseError> {
        let mut packet = Packet::default();
        let consumed = packet.parse_from(data)?;
        Ok((packet, consumed))
    }

    /// Parse one packet from the front of `data` into `self`.
    ///
    /// On success returns the number of bytes consumed. On any error
    /// `self` is left unmodified, so a pooled packet can be retried once
    /// more bytes arrive.
    pub fn parse_from(&mut self, data: &[u8]) -> Result<usize, ParseError> {
        if data.len() < HEADER_LEN {
            return Err(ParseError::Incomplete);
        }

        let magic = match &data[0..4] {
            m if m == REQ_MAGIC => Magic::Request,
            m if m == RES_MAGIC => Magic::Response,
            _ => return Err(ParseError::InvalidMagic),
        };

        let raw_command = u32::from_be_bytes(data[4..8].try_into().unwrap());
        let body_len = u32::from_be_bytes(data[8..12].try_into().unwrap()) as usize;

        if body_len > MAX_BODY_LEN {
            return Err(ParseError::TooLarge(body_len));
        }

        let command =
            Command::from_u32(raw_command).ok_or(ParseError::UnknownCommand(raw_command))?;

        if data.len() < HEADER_LEN + body_len {
            return Err(ParseError::Incomplete);
        }

        let body = &data[HEADER_LEN..HEADER_LEN + body_len];
        let expected = command.arg_count();

        // Split before touching self so errors leave the packet untouched.
        let mut parts: Vec<Bytes> = Vec::with_capacity(expected);
        if expected == 0 {
            if !body.is_empty() {
                return Err(ParseError::MalformedArgs(command.name()));
            }
        } else {
            let mut rest = body;
            for _ in 0..expected - 1 {
                let sep = rest
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or(ParseError::MalformedArgs(command.name()))?;
                parts.push(Bytes::copy_from_slice(&rest[..sep]));
                rest = &rest[sep + 1..];
            }
            // Final argument is the remainder, NULs and all.
            parts.push(Bytes::copy_from_slice(rest));
        }

        self.magic = magic;
        self.command = command;
        self.args = parts;

        Ok(HEADER_LEN + body_len)
    }

    /// Encode the packet onto the end of `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        let body_len = self.body_len();
        buf.reserve(HEADER_LEN + body_len);
        buf.extend_from_slice(self.magic.as_bytes());
        buf.extend_from_slice(&(self.command as u32).to_be_bytes());
        buf.extend_from_slice(&(body_len as u32).to_be_bytes());
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                buf.extend_from_slice(&[0]);
            }
            buf.extend_from_slice(arg);
        }
    }

    /// Encoded length of the packet including the header.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.body_len()
    }

    fn body_len(&self) -> usize {
        let args: usize = self.args.iter().map(|a| a.len()).sum();
        args + self.args.len().saturating_sub(1)
    }

    /// Argument at position `i`, if present.
    pub fn arg(&self, i: usize) -> Option<&[u8]> {
        self.args.get(i).map(|a| a.as_ref())
    }

    /// Clear the packet back to its pristine state, retaining argument
    /// vector capacity for reuse.
    pub fn reset(&mut self) {
        self.magic = Magic::Request;
        self.command = Command::default();
        self.args.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(packet: &Packet) -> BytesMut {
        let mut buf = BytesMut::new();
        packet.encode(&mut buf);
        buf
    }

    #[test]
    fn test_echo_roundtrip() {
        let buf = encoded(&Packet::request(Command::EchoReq, &[b"hello"]));
        assert_eq!(&buf[..4], b"\0REQ");

        let (packet, consumed) = Packet::parse(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(packet.magic, Magic::Request);
        assert_eq!(packet.command, Command::EchoReq);
        assert_eq!(packet.arg(0), Some(&b"hello"[..]));
    }

    #[test]
    fn test_multi_arg_splitting() {
        let buf = encoded(&Packet::request(
            Command::SubmitJob,
            &[b"resize", b"uniq-1", b"payload"],
        ));

        let (packet, _) = Packet::parse(&buf).unwrap();
        assert_eq!(packet.args.len(), 3);
        assert_eq!(packet.arg(0), Some(&b"resize"[..]));
        assert_eq!(packet.arg(1), Some(&b"uniq-1"[..]));
        assert_eq!(packet.arg(2), Some(&b"payload"[..]));
    }

    #[test]
    fn test_empty_args_preserved() {
        let buf = encoded(&Packet::request(Command::SubmitJob, &[b"f", b"", b""]));

        let (packet, _) = Packet::parse(&buf).unwrap();
        assert_eq!(packet.arg(0), Some(&b"f"[..]));
        assert_eq!(packet.arg(1), Some(&b""[..]));
        assert_eq!(packet.arg(2), Some(&b""[..]));
    }

    #[test]
    fn test_last_arg_may_contain_nul() {
        let buf = encoded(&Packet::response(
            Command::WorkComplete,
            &[b"H:x:1", b"bin\0ary\0data"],
        ));

        let (packet, _) = Packet::parse(&buf).unwrap();
        assert_eq!(packet.magic, Magic::Response);
        assert_eq!(packet.arg(1), Some(&b"bin\0ary\0data"[..]));
    }

    #[test]
    fn test_zero_arg_command() {
        let buf = encoded(&Packet::request(Command::GrabJob, &[]));
        assert_eq!(buf.len(), HEADER_LEN);

        let (packet, consumed) = Packet::parse(&buf).unwrap();
        assert_eq!(consumed, HEADER_LEN);
        assert_eq!(packet.command, Command::GrabJob);
        assert!(packet.args.is_empty());
    }

    #[test]
    fn test_incomplete_header_and_body() {
        let buf = encoded(&Packet::request(Command::EchoReq, &[b"hello"]));

        for cut in 0..buf.len() {
            assert_eq!(
                Packet::parse(&buf[..cut]).unwrap_err(),
                ParseError::Incomplete,
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn test_pipelined_packets() {
        let mut buf = encoded(&Packet::request(Command::GrabJob, &[]));
        Packet::request(Command::PreSleep, &[]).encode(&mut buf);

        let (first, consumed) = Packet::parse(&buf).unwrap();
        assert_eq!(first.command, Command::GrabJob);
        let (second, _) = Packet::parse(&buf[consumed..]).unwrap();
        assert_eq!(second.command, Command::PreSleep);
    }

    #[test]
    fn test_invalid_magic() {
        let mut buf = encoded(&Packet::request(Command::GrabJob, &[]));
        buf[0] = b'X';
        assert_eq!(Packet::parse(&buf).unwrap_err(), ParseError::InvalidMagic);
    }

    #[test]
    fn test_unknown_command() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\0REQ");
        buf.extend_from_slice(&999u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        assert_eq!(
            Packet::parse(&buf).unwrap_err(),
            ParseError::UnknownCommand(999)
        );
    }

    #[test]
    fn test_oversized_body_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\0REQ");
        buf.extend_from_slice(&(Command::EchoReq as u32).to_be_bytes());
        buf.extend_from_slice(&((MAX_BODY_LEN + 1) as u32).to_be_bytes());
        assert_eq!(
            Packet::parse(&buf).unwrap_err(),
            ParseError::TooLarge(MAX_BODY_LEN + 1)
        );
    }

    #[test]
    fn test_missing_separator_is_malformed() {
        // WORK_COMPLETE needs two arguments but the body has no NUL.
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\0RES");
        buf.extend_from_slice(&(Command::WorkComplete as u32).to_be_bytes());
        buf.extend_from_slice(&5u32.to_be_bytes());
        buf.extend_from_slice(b"H:x:1");
        assert!(matches!(
            Packet::parse(&buf).unwrap_err(),
            ParseError::MalformedArgs("WORK_COMPLETE")
        ));
    }

    #[test]
    fn test_trailing_body_on_bare_command() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\0REQ");
        buf.extend_from_slice(&(Command::GrabJob as u32).to_be_bytes());
        buf.extend_from_slice(&3u32.to_be_bytes());
        buf.extend_from_slice(b"xyz");
        assert!(matches!(
            Packet::parse(&buf).unwrap_err(),
            ParseError::MalformedArgs("GRAB_JOB")
        ));
    }

    #[test]
    fn test_parse_error_leaves_packet_untouched() {
        let buf = encoded(&Packet::request(Command::EchoReq, &[b"hello"]));

        let mut packet = Packet::default();
        assert_eq!(
            packet.parse_from(&buf[..HEADER_LEN]).unwrap_err(),
            ParseError::Incomplete
        );
        assert!(packet.args.is_empty());

        let consumed = packet.parse_from(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(packet.arg(0), Some(&b"hello"[..]));
    }

    #[test]
    fn test_reset_clears_state() {
        let buf = encoded(&Packet::response(Command::EchoRes, &[b"data"]));
        let (mut packet, _) = Packet::parse(&buf).unwrap();

        packet.reset();
        assert_eq!(packet, Packet::default());
    }

    #[test]
    fn test_command_wire_numbers() {
        assert_eq!(Command::CanDo as u32, 1);
        assert_eq!(Command::Noop as u32, 6);
        assert_eq!(Command::SubmitJob as u32, 7);
        assert_eq!(Command::JobAssign as u32, 11);
        assert_eq!(Command::SetClientId as u32, 22);
        assert_eq!(Command::from_u32(5), None);
        assert_eq!(Command::from_u32(21), None);
        assert_eq!(Command::from_u32(13), Some(Command::WorkComplete));
    }

    #[test]
    fn test_encoded_len_matches_encode() {
        let packet = Packet::request(Command::SubmitJob, &[b"fn", b"", b"data"]);
        let buf = encoded(&packet);
        assert_eq!(packet.encoded_len(), buf.len());
    }
}
