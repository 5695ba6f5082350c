pub mod frame;

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};

use log::{debug, info};
use she_core::{codec, Command, Reply, BLOCK_SIZE, KEY_SIZE, UID_SIZE};

use self::frame::{Packet, HEADER_SIZE, MAX_PAYLOAD};

#[derive(Debug)]
pub enum CommsError {
    /// Socket read/write failure or no connected client.
    Communication,
    /// Protocol violation that cannot be answered in-band.
    Frame,
    /// Command payload does not decode; answered with BAD_ARGS.
    BadRequest,
}

impl From<std::io::Error> for CommsError {
    fn from(_value: std::io::Error) -> Self {
        CommsError::Communication
    }
}

pub struct CommsChannel {
    listener: TcpListener,
    stream: Option<TcpStream>,
}

impl CommsChannel {
    pub fn bind(addr: &str) -> std::io::Result<Self> {
        Ok(CommsChannel {
            listener: TcpListener::bind(addr)?,
            stream: None,
        })
    }

    /// Blocks until the next client connects.
    pub fn accept(&mut self) -> std::io::Result<()> {
        let (stream, peer) = self.listener.accept()?;
        info!("client connected from {}", peer);
        self.stream = Some(stream);
        Ok(())
    }

    /// Reads one request frame. `None` signals a graceful disconnect.
    pub fn get_request(&mut self) -> Result<Option<Packet>, CommsError> {
        let stream = self.stream.as_mut().ok_or(CommsError::Communication)?;

        let mut header = [0u8; HEADER_SIZE];
        match stream.read_exact(&mut header) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(_) => return Err(CommsError::Communication),
        }

        let len = u16::from_be_bytes([header[4], header[5]]) as usize;
        if len > MAX_PAYLOAD {
            return Err(CommsError::Frame);
        }
        let mut payload = vec![0u8; len];
        stream
            .read_exact(&mut payload)
            .map_err(|_| CommsError::Communication)?;

        let packet = Packet {
            action: u16::from_be_bytes([header[0], header[1]]),
            rc: header[2],
            payload,
        };
        debug!(
            "request: action={:#06x} len={}",
            packet.action,
            packet.payload.len()
        );
        Ok(Some(packet))
    }

    pub fn send_reply(&mut self, packet: &Packet) -> Result<(), CommsError> {
        let bytes = packet.ser().map_err(|_| CommsError::Frame)?;
        self.stream
            .as_mut()
            .ok_or(CommsError::Communication)?
            .write_all(&bytes)
            .map_err(|_| CommsError::Communication)
    }
}

fn fixed<const N: usize>(payload: &[u8]) -> Result<&[u8; N], CommsError> {
    payload.try_into().map_err(|_| CommsError::BadRequest)
}

/// Decodes a request payload into a typed command. Anything malformed
/// is a transport-level BAD_ARGS, never remapped by the core.
pub fn decode_command<'a>(action: u16, payload: &'a [u8]) -> Result<Command<'a>, CommsError> {
    match action {
        frame::SHE_SET_UID => Ok(Command::SetUid(fixed::<UID_SIZE>(payload)?)),
        frame::SHE_SECURE_BOOT_INIT => {
            let size = fixed::<4>(payload)?;
            Ok(Command::SecureBootInit(u32::from_be_bytes(*size)))
        }
        frame::SHE_SECURE_BOOT_UPDATE => Ok(Command::SecureBootUpdate(payload)),
        frame::SHE_SECURE_BOOT_FINISH => Ok(Command::SecureBootFinish),
        frame::SHE_GET_STATUS => Ok(Command::GetStatus),
        frame::SHE_LOAD_KEY => {
            const TOTAL: usize = codec::M1_SIZE + codec::M2_SIZE + codec::M3_SIZE;
            if payload.len() != TOTAL {
                return Err(CommsError::BadRequest);
            }
            Ok(Command::LoadKey {
                m1: fixed(&payload[..codec::M1_SIZE])?,
                m2: fixed(&payload[codec::M1_SIZE..codec::M1_SIZE + codec::M2_SIZE])?,
                m3: fixed(&payload[codec::M1_SIZE + codec::M2_SIZE..])?,
            })
        }
        frame::SHE_LOAD_PLAIN_KEY => Ok(Command::LoadPlainKey(fixed::<KEY_SIZE>(payload)?)),
        frame::SHE_EXPORT_RAM_KEY => Ok(Command::ExportRamKey),
        frame::SHE_INIT_RND => Ok(Command::InitRnd),
        frame::SHE_RND => Ok(Command::Rnd),
        frame::SHE_EXTEND_SEED => Ok(Command::ExtendSeed(fixed::<KEY_SIZE>(payload)?)),
        frame::SHE_ENC_ECB | frame::SHE_DEC_ECB => {
            if payload.is_empty() {
                return Err(CommsError::BadRequest);
            }
            let key_id = payload[0];
            let data = &payload[1..];
            Ok(if action == frame::SHE_ENC_ECB {
                Command::EncEcb { key_id, data }
            } else {
                Command::DecEcb { key_id, data }
            })
        }
        frame::SHE_ENC_CBC | frame::SHE_DEC_CBC => {
            if payload.len() < 1 + BLOCK_SIZE {
                return Err(CommsError::BadRequest);
            }
            let key_id = payload[0];
            let iv = fixed::<BLOCK_SIZE>(&payload[1..1 + BLOCK_SIZE])?;
            let data = &payload[1 + BLOCK_SIZE..];
            Ok(if action == frame::SHE_ENC_CBC {
                Command::EncCbc { key_id, iv, data }
            } else {
                Command::DecCbc { key_id, iv, data }
            })
        }
        frame::SHE_GEN_MAC => {
            if payload.is_empty() {
                return Err(CommsError::BadRequest);
            }
            Ok(Command::GenerateMac {
                key_id: payload[0],
                data: &payload[1..],
            })
        }
        frame::SHE_VERIFY_MAC => {
            if payload.len() < 2 {
                return Err(CommsError::BadRequest);
            }
            let key_id = payload[0];
            let mac_len = payload[1] as usize;
            if payload.len() < 2 + mac_len {
                return Err(CommsError::BadRequest);
            }
            let split = payload.len() - mac_len;
            Ok(Command::VerifyMac {
                key_id,
                data: &payload[2..split],
                mac: &payload[split..],
            })
        }
        _ => Err(CommsError::BadRequest),
    }
}

/// Packs a handler reply into the response payload.
pub fn encode_reply(reply: &Reply) -> Vec<u8> {
    match reply {
        Reply::Done => Vec::new(),
        Reply::Status(sreg) => vec![*sreg],
        Reply::LoadKey { m4, m5 } => {
            let mut out = Vec::with_capacity(m4.len() + m5.len());
            out.extend_from_slice(m4);
            out.extend_from_slice(m5);
            out
        }
        Reply::RamKeyExport(export) => {
            let mut out = Vec::with_capacity(
                codec::M1_SIZE + codec::M2_SIZE + codec::M3_SIZE + codec::M4_SIZE + codec::M5_SIZE,
            );
            out.extend_from_slice(&export.m1);
            out.extend_from_slice(&export.m2);
            out.extend_from_slice(&export.m3);
            out.extend_from_slice(&export.m4);
            out.extend_from_slice(&export.m5);
            out
        }
        Reply::Random(bytes) => bytes.to_vec(),
        Reply::Cipher(data) => data.clone(),
        Reply::Mac(tag) => tag.to_vec(),
        Reply::MacVerdict(verdict) => vec![*verdict],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_uid_decodes() {
        let payload = [0x11u8; UID_SIZE];
        match decode_command(frame::SHE_SET_UID, &payload).unwrap() {
            Command::SetUid(uid) => assert_eq!(uid, &payload),
            cmd => panic!("unexpected command: {:?}", cmd),
        }
    }

    #[test]
    fn wrong_uid_length_is_bad_request() {
        assert!(matches!(
            decode_command(frame::SHE_SET_UID, &[0u8; 14]),
            Err(CommsError::BadRequest)
        ));
    }

    #[test]
    fn load_key_splits_into_message_tuple() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&[0x01; codec::M1_SIZE]);
        payload.extend_from_slice(&[0x02; codec::M2_SIZE]);
        payload.extend_from_slice(&[0x03; codec::M3_SIZE]);
        match decode_command(frame::SHE_LOAD_KEY, &payload).unwrap() {
            Command::LoadKey { m1, m2, m3 } => {
                assert_eq!(m1, &[0x01; codec::M1_SIZE]);
                assert_eq!(m2, &[0x02; codec::M2_SIZE]);
                assert_eq!(m3, &[0x03; codec::M3_SIZE]);
            }
            cmd => panic!("unexpected command: {:?}", cmd),
        }
    }

    #[test]
    fn verify_mac_splits_message_and_tag() {
        let mut payload = vec![0x04, 8];
        payload.extend_from_slice(b"the message");
        payload.extend_from_slice(&[0xAA; 8]);
        match decode_command(frame::SHE_VERIFY_MAC, &payload).unwrap() {
            Command::VerifyMac { key_id, data, mac } => {
                assert_eq!(key_id, 0x04);
                assert_eq!(data, b"the message");
                assert_eq!(mac, &[0xAA; 8]);
            }
            cmd => panic!("unexpected command: {:?}", cmd),
        }
    }

    #[test]
    fn unknown_opcode_is_bad_request() {
        assert!(matches!(
            decode_command(0x7777, &[]),
            Err(CommsError::BadRequest)
        ));
    }

    #[test]
    fn cbc_request_carries_iv() {
        let mut payload = vec![0x05];
        payload.extend_from_slice(&[0x10; BLOCK_SIZE]);
        payload.extend_from_slice(&[0x20; 32]);
        match decode_command(frame::SHE_ENC_CBC, &payload).unwrap() {
            Command::EncCbc { key_id, iv, data } => {
                assert_eq!(key_id, 0x05);
                assert_eq!(iv, &[0x10; BLOCK_SIZE]);
                assert_eq!(data, &[0x20; 32]);
            }
            cmd => panic!("unexpected command: {:?}", cmd),
        }
    }
}
