//! Modbus protocol support for EnviroDAS
//!
//! The field modules speak Modbus RTU carried over a raw TCP stream
//! (no MBAP header). This crate is the pure framing layer: CRC, request
//! encoding, response decoding. It performs no I/O and is fully testable
//! on byte vectors.

pub mod modbus;

pub use modbus::{
    crc16, decode_request, decode_response, expected_frame_len, ModbusError, ReadRequest,
};
