// Written against ISO 7816-4 (2005), restricted to what the mdoc NFC data
// transfer and handover-to-BLE flows require.

use strum_macros::EnumIter;

use crate::nfc::util::{impl_partial_enum, KnownOrRaw};

#[derive(Debug)]
pub struct Response {
    pub status: StatusWord,
    pub payload: Vec<u8>,
}

impl From<Response> for Vec<u8> {
    fn from(response: Response) -> Self {
        let mut response_bytes = Vec::with_capacity(2 + response.payload.len());
        response_bytes.extend_from_slice(&response.payload);
        response_bytes.extend_from_slice(&response.status.to_bytes());
        response_bytes
    }
}

impl From<StatusWord> for Response {
    fn from(status: StatusWord) -> Self {
        Response {
            status,
            payload: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWord {
    /// `9000`: success, or the final chunk of a chunked response.
    Ok,
    /// `61xx`: more data available; `xx` is the remaining length, or zero
    /// when more than 255 bytes remain.
    MoreDataAvailable(u8),
    /// `6700`
    IncorrectLength,
    /// `6985`
    ConditionsNotSatisfied,
    /// `6A82`
    FileOrApplicationNotFound,
    /// `6A86`: wrong P1/P2.
    WrongParameters,
    /// `6D00`
    InstructionNotSupported,
    /// `6F00`
    Unspecified,
}

impl StatusWord {
    pub fn to_bytes(self) -> [u8; 2] {
        match self {
            StatusWord::Ok => [0x90, 0x00],
            StatusWord::MoreDataAvailable(remaining) => [0x61, remaining],
            StatusWord::IncorrectLength => [0x67, 0x00],
            StatusWord::ConditionsNotSatisfied => [0x69, 0x85],
            StatusWord::FileOrApplicationNotFound => [0x6A, 0x82],
            StatusWord::WrongParameters => [0x6A, 0x86],
            StatusWord::InstructionNotSupported => [0x6D, 0x00],
            StatusWord::Unspecified => [0x6F, 0x00],
        }
    }
}

#[repr(u16)]
#[derive(Debug, EnumIter, Clone, Copy, PartialEq, Eq)]
pub enum FileId {
    CapabilityContainer = 0xE103,
    NdefFile = 0xE104,
}
impl_partial_enum!(FileId, u16);

pub const AID_MDOC_DATA_TRANSFER: &[u8] = &[0xA0, 0x00, 0x00, 0x02, 0x48, 0x04, 0x00];
pub const AID_NDEF_APPLICATION: &[u8] = &[0xD2, 0x76, 0x00, 0x00, 0x85, 0x01, 0x01];

#[derive(Debug)]
pub enum Apdu<'a> {
    SelectAid {
        aid: &'a [u8],
    },
    SelectFile {
        file_id: KnownOrRaw<u16, FileId>,
    },
    ReadBinary {
        offset: usize,
        length: usize,
    },
    UpdateBinary {
        offset: usize,
        data: &'a [u8],
    },
    /// Command-chained DO'53' transport: `more_data` reflects the chaining
    /// bit in the class byte.
    Envelope {
        more_data: bool,
        data: &'a [u8],
        extended_length: bool,
    },
    GetResponse {
        /// Requested length; zero with extended length means "everything
        /// remaining".
        length: usize,
        extended_length: bool,
    },
}

macro_rules! apdu_fail {
    ($status:expr) => {
        return Err(Response::from($status))
    };
}

struct Header {
    cla: u8,
    ins: u8,
    p1: u8,
    p2: u8,
}

impl<'a> Apdu<'a> {
    pub fn parse(command_bytes: &'a [u8]) -> Result<Self, Response> {
        if command_bytes.len() < 4 {
            apdu_fail!(StatusWord::IncorrectLength);
        }

        let header = Header {
            cla: command_bytes[0],
            ins: command_bytes[1],
            p1: command_bytes[2],
            p2: command_bytes[3],
        };
        let body = &command_bytes[4..];

        tracing::debug!(
            "processing APDU: CLA {:#04x}, INS {:#04x}, P1 {:#04x}, P2 {:#04x}, body {} bytes",
            header.cla,
            header.ins,
            header.p1,
            header.p2,
            body.len(),
        );

        match header.ins {
            // SELECT, 7.1.1
            0xA4 => Self::parse_select(&header, body),
            // READ BINARY, 7.2.3
            0xB0 => Self::parse_read_binary(&header, body),
            // UPDATE BINARY, 7.2.5
            0xD6 => Self::parse_update_binary(&header, body),
            // ENVELOPE, 7.6.2; INS C3 per the mdoc data transfer profile
            0xC3 => Self::parse_envelope(&header, body),
            // GET RESPONSE, 7.6.1
            0xC0 => Self::parse_get_response(&header, body),
            _ => apdu_fail!(StatusWord::InstructionNotSupported),
        }
    }

    fn parse_select(header: &Header, body: &'a [u8]) -> Result<Self, Response> {
        let (payload, _) = split_lc_payload(body)?;
        match header.p1 {
            0x00 => {
                if payload.len() != 2 {
                    apdu_fail!(StatusWord::IncorrectLength);
                }
                let file_id = u16::from_be_bytes([payload[0], payload[1]]).into();
                Ok(Apdu::SelectFile { file_id })
            }
            0x04 => Ok(Apdu::SelectAid { aid: payload }),
            _ => apdu_fail!(StatusWord::WrongParameters),
        }
    }

    fn parse_read_binary(header: &Header, body: &'a [u8]) -> Result<Self, Response> {
        // P1 b8 set would make P1 an EF identifier, which is not supported.
        if header.p1 & 0x80 != 0 {
            apdu_fail!(StatusWord::WrongParameters);
        }
        let offset = u16::from_be_bytes([header.p1, header.p2]) as usize;
        let length = match body {
            [] => apdu_fail!(StatusWord::IncorrectLength),
            [le] => {
                if *le == 0 {
                    256
                } else {
                    *le as usize
                }
            }
            [0x00, hi, lo] => {
                let le = u16::from_be_bytes([*hi, *lo]) as usize;
                if le == 0 {
                    65536
                } else {
                    le
                }
            }
            _ => apdu_fail!(StatusWord::IncorrectLength),
        };
        Ok(Apdu::ReadBinary { offset, length })
    }

    fn parse_update_binary(header: &Header, body: &'a [u8]) -> Result<Self, Response> {
        if header.p1 & 0x80 != 0 {
            apdu_fail!(StatusWord::WrongParameters);
        }
        let offset = u16::from_be_bytes([header.p1, header.p2]) as usize;
        let (data, _) = split_lc_payload(body)?;
        Ok(Apdu::UpdateBinary { offset, data })
    }

    fn parse_envelope(header: &Header, body: &'a [u8]) -> Result<Self, Response> {
        if header.p1 != 0x00 || header.p2 != 0x00 {
            apdu_fail!(StatusWord::WrongParameters);
        }
        // CLA bit 5 set: more command data follows in further ENVELOPEs.
        let more_data = header.cla & 0x10 != 0;
        let (data, extended_length) = split_lc_payload(body)?;
        Ok(Apdu::Envelope {
            more_data,
            data,
            extended_length,
        })
    }

    fn parse_get_response(header: &Header, body: &'a [u8]) -> Result<Self, Response> {
        if header.p1 != 0x00 || header.p2 != 0x00 {
            apdu_fail!(StatusWord::WrongParameters);
        }
        let (length, extended_length) = match body {
            [] => apdu_fail!(StatusWord::IncorrectLength),
            [le] => {
                let le = if *le == 0 { 256 } else { *le as usize };
                (le, false)
            }
            [0x00, hi, lo] => {
                let le = u16::from_be_bytes([*hi, *lo]) as usize;
                (le, true)
            }
            _ => apdu_fail!(StatusWord::IncorrectLength),
        };
        Ok(Apdu::GetResponse {
            length,
            extended_length,
        })
    }
}

/// Split an APDU body into the Lc-prefixed command payload, tolerating a
/// trailing Le field. Returns the payload and whether extended length
/// encoding was used.
fn split_lc_payload(body: &[u8]) -> Result<(&[u8], bool), Response> {
    if body.is_empty() {
        return Ok((&[], false));
    }
    // Extended form: 0x00 followed by a two-byte length.
    if body[0] == 0x00 && body.len() > 3 {
        let payload_len = u16::from_be_bytes([body[1], body[2]]) as usize;
        let payload = body
            .get(3..3 + payload_len)
            .ok_or(Response::from(StatusWord::IncorrectLength))?;
        let trailer = &body[3 + payload_len..];
        // Zero or two trailing Le bytes are acceptable.
        if !trailer.is_empty() && trailer.len() != 2 {
            return Err(Response::from(StatusWord::IncorrectLength));
        }
        return Ok((payload, true));
    }

    let payload_len = body[0] as usize;
    let payload = body
        .get(1..1 + payload_len)
        .ok_or(Response::from(StatusWord::IncorrectLength))?;
    let trailer = &body[1 + payload_len..];
    if trailer.len() > 1 {
        return Err(Response::from(StatusWord::IncorrectLength));
    }
    Ok((payload, false))
}

/// Wrap an encrypted session message in BER-TLV data object '53'.
pub fn wrap_do53(data: &[u8]) -> Vec<u8> {
    let mut out = vec![0x53];
    let len = data.len();
    if len < 0x80 {
        out.push(len as u8);
    } else if len <= 0xFF {
        out.push(0x81);
        out.push(len as u8);
    } else {
        out.push(0x82);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    }
    out.extend_from_slice(data);
    out
}

#[derive(Debug, thiserror::Error)]
pub enum Do53Error {
    #[error("not a DO'53' data object")]
    WrongTag,
    #[error("truncated DO'53' data object")]
    Truncated,
}

/// Extract the content of a BER-TLV data object '53'.
pub fn unwrap_do53(bytes: &[u8]) -> Result<&[u8], Do53Error> {
    let [0x53, rest @ ..] = bytes else {
        return Err(Do53Error::WrongTag);
    };
    let (len, content) = match rest {
        [l, content @ ..] if *l < 0x80 => (*l as usize, content),
        [0x81, l, content @ ..] => (*l as usize, content),
        [0x82, hi, lo, content @ ..] => (u16::from_be_bytes([*hi, *lo]) as usize, content),
        _ => return Err(Do53Error::Truncated),
    };
    content.get(..len).ok_or(Do53Error::Truncated)
}
