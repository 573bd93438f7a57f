//! Modbus RTU frame encoding and decoding
//!
//! Request layout: `addr | fc | start_hi | start_lo | count_hi | count_lo | crc_lo | crc_hi`.
//! Response layout: `addr | fc | byte_count | data[byte_count] | crc_lo | crc_hi`.
//! Register words are big-endian on the wire; the CRC is transmitted low
//! byte first.

use thiserror::Error;

/// Read request frame length (addr + fc + start + count + crc).
pub const READ_REQUEST_LEN: usize = 8;

/// Shortest decodable response (exception frame).
pub const MIN_RESPONSE_LEN: usize = 5;

/// Modbus limit on registers per read request.
pub const MAX_REGISTERS_PER_READ: u16 = 125;

/// Framing error taxonomy.
///
/// The CRC is validated before any field is interpreted, so a corrupted
/// frame surfaces as `Crc` (or `Truncated`/`Malformed` for length damage),
/// never as a bogus register value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModbusError {
    #[error("frame truncated: {len} bytes")]
    Truncated { len: usize },

    #[error("frame malformed: {0}")]
    Malformed(String),

    #[error("CRC mismatch: calculated {calculated:#06x}, received {received:#06x}")]
    Crc { calculated: u16, received: u16 },

    #[error("slave address mismatch: expected {expected}, got {actual}")]
    AddressMismatch { expected: u8, actual: u8 },

    #[error("device exception {code:#04x} for function {function:#04x}")]
    Exception { function: u8, code: u8 },
}

pub type Result<T> = std::result::Result<T, ModbusError>;

/// Standard Modbus CRC-16: polynomial 0xA001 (reflected 0x8005), init 0xFFFF.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// A register read request (function 3 or 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub slave_addr: u8,
    pub function_code: u8,
    pub start_register: u16,
    pub register_count: u16,
}

impl ReadRequest {
    pub fn new(slave_addr: u8, function_code: u8, start_register: u16, register_count: u16) -> Self {
        Self {
            slave_addr,
            function_code,
            start_register,
            register_count,
        }
    }

    /// Encode into the 8-byte wire frame, CRC low byte first.
    pub fn encode(&self) -> [u8; READ_REQUEST_LEN] {
        let mut frame = [0u8; READ_REQUEST_LEN];
        frame[0] = self.slave_addr;
        frame[1] = self.function_code;
        frame[2..4].copy_from_slice(&self.start_register.to_be_bytes());
        frame[4..6].copy_from_slice(&self.register_count.to_be_bytes());
        let crc = crc16(&frame[..6]);
        frame[6..8].copy_from_slice(&crc.to_le_bytes());
        frame
    }

    /// Bytes of response data a well-formed reply must carry.
    pub fn expected_byte_count(&self) -> usize {
        usize::from(self.register_count) * 2
    }
}

/// Decode a request frame (used by tests and device simulators).
pub fn decode_request(frame: &[u8]) -> Result<ReadRequest> {
    if frame.len() < READ_REQUEST_LEN {
        return Err(ModbusError::Truncated { len: frame.len() });
    }
    check_crc(&frame[..READ_REQUEST_LEN])?;
    Ok(ReadRequest {
        slave_addr: frame[0],
        function_code: frame[1],
        start_register: u16::from_be_bytes([frame[2], frame[3]]),
        register_count: u16::from_be_bytes([frame[4], frame[5]]),
    })
}

/// Total frame length implied by a response header, once enough bytes have
/// arrived to tell. Drives frame reassembly on the TCP stream.
pub fn expected_frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 2 {
        return None;
    }
    if buf[1] & 0x80 != 0 {
        // Exception frame: addr + fc + code + crc
        return Some(MIN_RESPONSE_LEN);
    }
    if buf.len() < 3 {
        return None;
    }
    Some(3 + usize::from(buf[2]) + 2)
}

/// Decode a response to `request`, returning the register words.
///
/// Check order: truncation, CRC, slave address, exception bit, function
/// code, byte count. Flipping any bit of a valid frame therefore yields
/// `Crc` (payload damage) or `Truncated`/`Malformed` (length damage).
pub fn decode_response(frame: &[u8], request: &ReadRequest) -> Result<Vec<u16>> {
    if frame.len() < MIN_RESPONSE_LEN {
        return Err(ModbusError::Truncated { len: frame.len() });
    }
    check_crc(frame)?;

    let slave_addr = frame[0];
    if slave_addr != request.slave_addr {
        return Err(ModbusError::AddressMismatch {
            expected: request.slave_addr,
            actual: slave_addr,
        });
    }

    let function = frame[1];
    if function & 0x80 != 0 {
        return Err(ModbusError::Exception {
            function: function & 0x7F,
            code: frame[2],
        });
    }
    if function != request.function_code {
        return Err(ModbusError::Malformed(format!(
            "function code {:#04x}, expected {:#04x}",
            function, request.function_code
        )));
    }

    let byte_count = usize::from(frame[2]);
    if byte_count != request.expected_byte_count() {
        return Err(ModbusError::Malformed(format!(
            "byte count {byte_count}, expected {}",
            request.expected_byte_count()
        )));
    }
    if frame.len() != 3 + byte_count + 2 {
        return Err(ModbusError::Malformed(format!(
            "frame length {} for byte count {byte_count}",
            frame.len()
        )));
    }

    let mut registers = Vec::with_capacity(byte_count / 2);
    for pair in frame[3..3 + byte_count].chunks_exact(2) {
        registers.push(u16::from_be_bytes([pair[0], pair[1]]));
    }
    Ok(registers)
}

/// Build a response frame (device side; used by simulators and tests).
pub fn encode_response(slave_addr: u8, function_code: u8, registers: &[u16]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(3 + registers.len() * 2 + 2);
    frame.push(slave_addr);
    frame.push(function_code);
    frame.push((registers.len() * 2) as u8);
    for register in registers {
        frame.extend_from_slice(&register.to_be_bytes());
    }
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Build an exception frame (device side).
pub fn encode_exception(slave_addr: u8, function_code: u8, code: u8) -> Vec<u8> {
    let mut frame = vec![slave_addr, function_code | 0x80, code];
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

fn check_crc(frame: &[u8]) -> Result<()> {
    let split = frame.len() - 2;
    let calculated = crc16(&frame[..split]);
    let received = u16::from_le_bytes([frame[split], frame[split + 1]]);
    if calculated != received {
        return Err(ModbusError::Crc {
            calculated,
            received,
        });
    }
    Ok(())
}
