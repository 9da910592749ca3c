//! End-of-string interpose layer for [`Octet`].
//!
//! Sits on top of a driver that knows nothing about message terminators:
//!
//! - reads are buffered and split on the input terminator, which is stripped
//!   and reported as [`EomReason::EOS`],
//! - writes get the output terminator appended.
//!
//! Terminators are at most [`EOS_MAX`] bytes and are usually given in escaped
//! form (`"\r\n"`, `"\x03"`); see [`parse_eos`].

use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use arrayvec::ArrayVec;

use crate::error::AsynResult;
use crate::interfaces::{EomReason, Octet};
use crate::lock::guard;
use crate::port::PortHandle;
use crate::registry::Interface;
use crate::user::AsynUser;

/// Longest supported terminator.
pub const EOS_MAX: usize = 2;

/// Size of one read from the layer below.
const CHUNK_SIZE: usize = 256;

type Eos = ArrayVec<u8, EOS_MAX>;

struct EosState {
    input_eos: Eos,
    output_eos: Eos,
    /// Bytes read from below but not yet delivered.
    pending: Vec<u8>,
}

/// The interposed `Octet` layer.
pub struct EosInterpose {
    port: String,
    addr: i32,
    lower: Interface<dyn Octet>,
    state: Mutex<EosState>,
}

impl EosInterpose {
    /// Interposes a new EOS layer on `port` at `addr`.
    ///
    /// # Errors
    ///
    /// `NotFound` if the port has no `asynOctet` interface at `addr`.
    pub fn install(port: &PortHandle, addr: i32) -> AsynResult<Arc<Self>> {
        let mut installed = None;
        port.interpose_interface_with::<dyn Octet, _>(addr, |lower| {
            let layer = Arc::new(Self {
                port: port.name().to_owned(),
                addr,
                lower,
                state: Mutex::new(EosState {
                    input_eos: Eos::new(),
                    output_eos: Eos::new(),
                    pending: Vec::new(),
                }),
            });
            installed = Some(Arc::clone(&layer));
            layer as Arc<dyn Octet>
        })?;
        match installed {
            Some(layer) => {
                debug!("EOS layer installed on {} addr {}", layer.port, addr);
                Ok(layer)
            }
            None => asyn_err!(Error, "EOS layer on {} addr {} was not built", port.name(), addr),
        }
    }

    fn to_eos(user: &AsynUser, eos: &[u8]) -> AsynResult<Eos> {
        match Eos::try_from(eos) {
            Ok(eos) => Ok(eos),
            Err(_) => asyn_err!(user => Error, "EOS {:?} longer than {} bytes", escape_eos(eos), EOS_MAX),
        }
    }

    /// Moves up to `buf.len()` pending bytes into `buf`, stopping at the
    /// first terminator.
    fn deliver(state: &mut EosState, buf: &mut [u8], end: bool) -> Option<(usize, EomReason)> {
        let eos = state.input_eos.as_slice();
        if let Some(pos) = find(&state.pending, eos) {
            if pos <= buf.len() {
                buf[..pos].copy_from_slice(&state.pending[..pos]);
                state.pending.drain(..pos + eos.len());
                return Some((pos, EomReason::EOS));
            }
        }
        if state.pending.len() >= buf.len() {
            let n = buf.len();
            buf.copy_from_slice(&state.pending[..n]);
            state.pending.drain(..n);
            return Some((n, EomReason::CNT));
        }
        if end {
            let n = state.pending.len();
            buf[..n].copy_from_slice(&state.pending);
            state.pending.clear();
            return Some((n, EomReason::END));
        }
        None
    }
}

impl Octet for EosInterpose {
    fn write(&self, user: &AsynUser, data: &[u8]) -> AsynResult<usize> {
        let lower = &self.lower;
        let output_eos = guard(&self.state).output_eos.clone();
        if output_eos.is_empty() {
            return lower.write(user, data);
        }
        let mut framed = Vec::with_capacity(data.len() + output_eos.len());
        framed.extend_from_slice(data);
        framed.extend_from_slice(&output_eos);
        let written = lower.write(user, &framed)?;
        Ok(written.min(data.len()))
    }

    fn read(&self, user: &AsynUser, buf: &mut [u8]) -> AsynResult<(usize, EomReason)> {
        {
            let mut state = guard(&self.state);
            if state.input_eos.is_empty() {
                if state.pending.is_empty() {
                    drop(state);
                    return self.lower.read(user, buf);
                }
                // Left over from before the terminator was cleared
                let n = state.pending.len().min(buf.len());
                buf[..n].copy_from_slice(&state.pending[..n]);
                state.pending.drain(..n);
                let eom = if n == buf.len() { EomReason::CNT } else { EomReason::empty() };
                return Ok((n, eom));
            }
            if let Some(done) = Self::deliver(&mut state, buf, false) {
                return Ok(done);
            }
        }
        // The state lock is not held across reads from below
        loop {
            let mut chunk = [0u8; CHUNK_SIZE];
            let (n, eom) = self.lower.read(user, &mut chunk)?;
            let end = n == 0 || eom.contains(EomReason::END);
            let mut state = guard(&self.state);
            state.pending.extend_from_slice(&chunk[..n]);
            if let Some(done) = Self::deliver(&mut state, buf, end) {
                return Ok(done);
            }
        }
    }

    fn flush(&self, user: &AsynUser) -> AsynResult {
        guard(&self.state).pending.clear();
        self.lower.flush(user)
    }

    fn set_input_eos(&self, user: &AsynUser, eos: &[u8]) -> AsynResult {
        let eos = Self::to_eos(user, eos)?;
        debug!("{} addr {} input EOS {}", self.port, self.addr, escape_eos(&eos));
        guard(&self.state).input_eos = eos;
        Ok(())
    }

    fn input_eos(&self, _user: &AsynUser) -> AsynResult<Vec<u8>> {
        Ok(guard(&self.state).input_eos.to_vec())
    }

    fn set_output_eos(&self, user: &AsynUser, eos: &[u8]) -> AsynResult {
        let eos = Self::to_eos(user, eos)?;
        debug!("{} addr {} output EOS {}", self.port, self.addr, escape_eos(&eos));
        guard(&self.state).output_eos = eos;
        Ok(())
    }

    fn output_eos(&self, _user: &AsynUser) -> AsynResult<Vec<u8>> {
        Ok(guard(&self.state).output_eos.to_vec())
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Translates an escaped terminator string into bytes.
///
/// Understands `\a \b \f \n \r \t \v \\ \' \" \?`, octal `\NNN` and hex
/// `\xNN`. Any other character stands for itself.
pub fn parse_eos(text: &str) -> AsynResult<Vec<u8>> {
    let mut out = Vec::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut utf8 = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut utf8).as_bytes());
            continue;
        }
        let Some(e) = chars.next() else {
            return asyn_err!(Error, "trailing backslash in {:?}", text);
        };
        let byte = match e {
            'a' => 0x07,
            'b' => 0x08,
            'f' => 0x0c,
            'n' => b'\n',
            'r' => b'\r',
            't' => b'\t',
            'v' => 0x0b,
            '\\' | '\'' | '"' | '?' => e as u8,
            '0'..='7' => {
                let mut value = e.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match chars.peek().and_then(|d| d.to_digit(8)) {
                        Some(d) => {
                            value = value * 8 + d;
                            chars.next();
                        }
                        None => break,
                    }
                }
                match u8::try_from(value) {
                    Ok(byte) => byte,
                    Err(_) => return asyn_err!(Error, "octal escape out of range in {:?}", text),
                }
            }
            'x' => {
                let mut value = 0u32;
                let mut digits = 0;
                while digits < 2 {
                    match chars.peek().and_then(|d| d.to_digit(16)) {
                        Some(d) => {
                            value = value * 16 + d;
                            chars.next();
                            digits += 1;
                        }
                        None => break,
                    }
                }
                if digits == 0 {
                    return asyn_err!(Error, "\\x without hex digits in {:?}", text);
                }
                value as u8
            }
            other => {
                let mut utf8 = [0u8; 4];
                out.extend_from_slice(other.encode_utf8(&mut utf8).as_bytes());
                continue;
            }
        };
        out.push(byte);
    }
    Ok(out)
}

/// Renders bytes in the escaped form accepted by [`parse_eos`].
pub fn escape_eos(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        match b {
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            b'\\' => out.push_str("\\\\"),
            b'"' => out.push_str("\\\""),
            0x20..=0x7e => out.push(b as char),
            _ => {
                let _ = write!(out, "\\x{:02x}", b);
            }
        }
    }
    out
}
