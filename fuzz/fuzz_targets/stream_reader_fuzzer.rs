//! Fuzz target for the secured stream reader
//!
//! # Strategy
//!
//! - Raw input: arbitrary bytes fed straight to a reader
//! - Tampering: a valid stream with bytes flipped, cut or appended
//! - Frame lengths: any valid frame length, both ends agreeing
//!
//! # Invariants
//!
//! - The reader never panics and never returns data from a frame that
//!   failed authentication
//! - An untampered stream reads back exactly what was written
//! - A tampered stream never reads back successfully as different data

#![no_main]

use std::io::{Cursor, Read, Write};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tagwire_core::{
    ConnectionContext, ContactId, Role, StreamConfig, TransportId,
    stream::{create_secured_reader_with_config, create_secured_writer_with_config},
};
use tagwire_crypto::{SECRET_LENGTH, SecretBytes};
use tagwire_proto::{MAX_FRAME_LENGTH, MIN_FRAME_LENGTH};

#[derive(Debug, Clone, Arbitrary)]
enum Input {
    Raw(Vec<u8>),
    Sealed { frame_length: u16, message: Vec<u8>, tamper: Tamper },
}

#[derive(Debug, Clone, Arbitrary)]
enum Tamper {
    None,
    Flip { position: u16, mask: u8 },
    Cut(u16),
    Append(Vec<u8>),
}

fn context(role: Role) -> ConnectionContext {
    ConnectionContext {
        contact: ContactId(1),
        transport: TransportId::new("fuzz"),
        period: 1,
        secret: SecretBytes::new([0x42; SECRET_LENGTH]),
        stream_number: 0,
        alice: false,
        role,
    }
}

fn read_all(wire: Vec<u8>, config: StreamConfig) -> std::io::Result<Vec<u8>> {
    let mut reader =
        create_secured_reader_with_config(Cursor::new(wire), &context(Role::Initiator), config)
            .map_err(std::io::Error::from)?;
    let mut out = Vec::new();
    reader.read_to_end(&mut out)?;
    Ok(out)
}

fuzz_target!(|input: Input| {
    match input {
        Input::Raw(bytes) => {
            let _ = read_all(bytes, StreamConfig::default());
        },
        Input::Sealed { frame_length, message, tamper } => {
            let span = MAX_FRAME_LENGTH - MIN_FRAME_LENGTH + 1;
            let config =
                StreamConfig { frame_length: MIN_FRAME_LENGTH + usize::from(frame_length) % span };

            // Responder side writes: no tag, frames only
            let Ok(mut writer) =
                create_secured_writer_with_config(Vec::new(), &context(Role::Responder), config)
            else {
                unreachable!("frame length is in range")
            };
            let Ok(()) = writer.write_all(&message) else { unreachable!() };
            let Ok(()) = writer.close() else { unreachable!() };
            let mut wire = writer.into_inner();

            // A stream cut to nothing is indistinguishable from an empty one
            let mut emptied = false;
            let tampered = match tamper {
                Tamper::None => false,
                Tamper::Flip { position, mask } => {
                    if mask == 0 || wire.is_empty() {
                        false
                    } else {
                        let i = usize::from(position) % wire.len();
                        wire[i] ^= mask;
                        true
                    }
                },
                Tamper::Cut(n) => {
                    let cut = usize::from(n) % (wire.len() + 1);
                    wire.truncate(wire.len() - cut);
                    emptied = wire.is_empty();
                    cut > 0
                },
                Tamper::Append(extra) => {
                    // Bytes after the final frame are never read
                    wire.extend_from_slice(&extra);
                    false
                },
            };

            match read_all(wire, config) {
                Ok(out) if tampered => {
                    assert!(emptied && out.is_empty(), "tampered stream read back");
                },
                Ok(out) => assert_eq!(out, message),
                Err(_) => assert!(tampered, "untampered stream rejected"),
            }
        },
    }
});
