//! TCP-backed [`SerialBackend`] (spec.md §4.8 "TCP back-channel"), with a
//! small state machine that strips telnet `IAC` negotiation sequences out
//! of the inbound byte stream before they reach the UART's receive FIFO.
//! Grounded on `original_source/src/TraceEngine.cpp`'s socket handling
//! being replaced here by `std::net::TcpListener` polled non-blocking, the
//! idiomatic equivalent of the source's `select()` with a zero timeout.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Mutex;

use crate::uart::SerialBackend;

const IAC: u8 = 255;
const SB: u8 = 250;
const SE: u8 = 240;

#[derive(Clone, Copy, PartialEq, Eq)]
enum IacState {
    Data,
    SawIac,
    SawCommand,
    InSubnegotiation,
    SubnegotiationSawIac,
}

struct Inner {
    listener: TcpListener,
    stream: Option<TcpStream>,
    state: IacState,
}

pub struct TcpSerialBackend {
    inner: Mutex<Inner>,
}

impl TcpSerialBackend {
    pub fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(TcpSerialBackend {
            inner: Mutex::new(Inner { listener, stream: None, state: IacState::Data }),
        })
    }

    fn accept_if_needed(inner: &mut Inner) {
        if inner.stream.is_some() {
            return;
        }
        if let Ok((stream, _addr)) = inner.listener.accept() {
            let _ = stream.set_nonblocking(true);
            inner.stream = Some(stream);
            inner.state = IacState::Data;
        }
    }

    /// Filters one raw byte through the telnet option-negotiation state
    /// machine, returning `Some(byte)` for bytes that are real serial data.
    fn filter(state: &mut IacState, byte: u8) -> Option<u8> {
        match *state {
            IacState::Data => {
                if byte == IAC {
                    *state = IacState::SawIac;
                    None
                } else {
                    Some(byte)
                }
            }
            IacState::SawIac => {
                if byte == IAC {
                    *state = IacState::Data;
                    Some(IAC) // an escaped 0xFF data byte
                } else if byte == SB {
                    *state = IacState::InSubnegotiation;
                    None
                } else {
                    *state = IacState::SawCommand;
                    None
                }
            }
            IacState::SawCommand => {
                *state = IacState::Data;
                None
            }
            IacState::InSubnegotiation => {
                if byte == IAC {
                    *state = IacState::SubnegotiationSawIac;
                }
                None
            }
            IacState::SubnegotiationSawIac => {
                *state = if byte == SE { IacState::Data } else { IacState::InSubnegotiation };
                None
            }
        }
    }

    /// Drain whatever bytes are currently available, with telnet `IAC`
    /// sequences already stripped out.
    pub fn poll_incoming(&self) -> Vec<u8> {
        let mut inner = self.inner.lock().unwrap();
        Self::accept_if_needed(&mut inner);
        let Some(stream) = inner.stream.as_mut() else {
            return Vec::new();
        };
        let mut raw = [0u8; 256];
        let n = match stream.read(&mut raw) {
            Ok(0) => {
                inner.stream = None;
                return Vec::new();
            }
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Vec::new(),
            Err(_) => {
                inner.stream = None;
                return Vec::new();
            }
        };
        let mut state = inner.state;
        let out = raw[..n].iter().filter_map(|b| Self::filter(&mut state, *b)).collect();
        inner.state = state;
        out
    }
}

impl SerialBackend for TcpSerialBackend {
    fn transmit(&self, byte: u8) {
        let mut inner = self.inner.lock().unwrap();
        Self::accept_if_needed(&mut inner);
        if let Some(stream) = inner.stream.as_mut() {
            if stream.write_all(&[byte]).is_err() {
                inner.stream = None;
            }
        }
    }
}
