//! Packet framing for the SHE transport.
//!
//! A frame is a fixed header followed by the command payload:
//! action (u16 BE), response code, a reserved byte, payload length
//! (u16 BE). The response reuses the header with `rc` filled in.

pub const HEADER_SIZE: usize = 6;
pub const MAX_PAYLOAD: usize = 0x1000;

/* Command opcodes */
pub const SHE_SET_UID: u16 = 0x0001;
pub const SHE_SECURE_BOOT_INIT: u16 = 0x0002;
pub const SHE_SECURE_BOOT_UPDATE: u16 = 0x0003;
pub const SHE_SECURE_BOOT_FINISH: u16 = 0x0004;
pub const SHE_GET_STATUS: u16 = 0x0005;
pub const SHE_LOAD_KEY: u16 = 0x0006;
pub const SHE_LOAD_PLAIN_KEY: u16 = 0x0007;
pub const SHE_EXPORT_RAM_KEY: u16 = 0x0008;
pub const SHE_INIT_RND: u16 = 0x0009;
pub const SHE_RND: u16 = 0x000A;
pub const SHE_EXTEND_SEED: u16 = 0x000B;
pub const SHE_ENC_ECB: u16 = 0x000C;
pub const SHE_ENC_CBC: u16 = 0x000D;
pub const SHE_DEC_ECB: u16 = 0x000E;
pub const SHE_DEC_CBC: u16 = 0x000F;
pub const SHE_GEN_MAC: u16 = 0x0010;
pub const SHE_VERIFY_MAC: u16 = 0x0011;

#[derive(Debug, PartialEq, Eq)]
pub enum FrameError {
    Truncated,
    Oversized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub action: u16,
    pub rc: u8,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn request(action: u16, payload: Vec<u8>) -> Self {
        Packet {
            action,
            rc: 0,
            payload,
        }
    }

    pub fn reply(action: u16, rc: u8, payload: Vec<u8>) -> Self {
        Packet {
            action,
            rc,
            payload,
        }
    }

    pub fn ser(&self) -> Result<Vec<u8>, FrameError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(FrameError::Oversized);
        }
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.action.to_be_bytes());
        out.push(self.rc);
        out.push(0);
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    pub fn de(input: &[u8]) -> Result<Self, FrameError> {
        if input.len() < HEADER_SIZE {
            return Err(FrameError::Truncated);
        }
        let action = u16::from_be_bytes([input[0], input[1]]);
        let rc = input[2];
        let len = u16::from_be_bytes([input[4], input[5]]) as usize;
        if len > MAX_PAYLOAD {
            return Err(FrameError::Oversized);
        }
        if input.len() < HEADER_SIZE + len {
            return Err(FrameError::Truncated);
        }
        Ok(Packet {
            action,
            rc,
            payload: input[HEADER_SIZE..HEADER_SIZE + len].to_vec(),
        })
    }
}
