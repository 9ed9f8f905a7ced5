//! In-process Modbus TCP device simulator.
//!
//! Speaks real MBAP framing over loopback so the protocol clients, pools
//! and breaker can be exercised end-to-end without hardware. Register
//! banks are plain vectors behind a mutex; an offline switch refuses new
//! connections and drops live ones to simulate a dead device.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const BANK_SIZE: usize = 1024;

#[derive(Debug)]
struct Banks {
    coils: Vec<bool>,
    discrete: Vec<bool>,
    holding: Vec<u16>,
    input: Vec<u16>,
}

impl Banks {
    fn new() -> Self {
        Banks {
            coils: vec![false; BANK_SIZE],
            discrete: vec![false; BANK_SIZE],
            holding: vec![0; BANK_SIZE],
            input: vec![0; BANK_SIZE],
        }
    }
}

pub struct ModbusSimulator {
    addr: std::net::SocketAddr,
    banks: Arc<Mutex<Banks>>,
    offline: Arc<AtomicBool>,
    request_count: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl ModbusSimulator {
    /// Bind on an ephemeral loopback port and start accepting.
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let banks = Arc::new(Mutex::new(Banks::new()));
        let offline = Arc::new(AtomicBool::new(false));
        let request_count = Arc::new(AtomicU64::new(0));
        let cancel = CancellationToken::new();

        let accept_banks = banks.clone();
        let accept_offline = offline.clone();
        let accept_count = request_count.clone();
        let accept_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                let Ok((stream, peer)) = accepted else { continue };
                if accept_offline.load(Ordering::Acquire) {
                    // Dead device: refuse by closing immediately.
                    drop(stream);
                    continue;
                }
                debug!(peer = %peer, "simulator connection accepted");
                tokio::spawn(serve_connection(
                    stream,
                    accept_banks.clone(),
                    accept_offline.clone(),
                    accept_count.clone(),
                    accept_cancel.clone(),
                ));
            }
        });

        Ok(ModbusSimulator {
            addr,
            banks,
            offline,
            request_count,
            cancel,
        })
    }

    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    /// Refuse new connections and cut live ones on their next request.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    pub fn requests_served(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn set_holding(&self, addr: u16, words: &[u16]) {
        let mut banks = self.banks.lock().unwrap();
        for (i, w) in words.iter().enumerate() {
            banks.holding[addr as usize + i] = *w;
        }
    }

    pub fn holding(&self, addr: u16, count: usize) -> Vec<u16> {
        let banks = self.banks.lock().unwrap();
        banks.holding[addr as usize..addr as usize + count].to_vec()
    }

    pub fn set_input(&self, addr: u16, words: &[u16]) {
        let mut banks = self.banks.lock().unwrap();
        for (i, w) in words.iter().enumerate() {
            banks.input[addr as usize + i] = *w;
        }
    }

    pub fn set_coil(&self, addr: u16, state: bool) {
        self.banks.lock().unwrap().coils[addr as usize] = state;
    }

    pub fn coil(&self, addr: u16) -> bool {
        self.banks.lock().unwrap().coils[addr as usize]
    }

    pub fn set_discrete(&self, addr: u16, state: bool) {
        self.banks.lock().unwrap().discrete[addr as usize] = state;
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ModbusSimulator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    banks: Arc<Mutex<Banks>>,
    offline: Arc<AtomicBool>,
    request_count: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    loop {
        let mut header = [0u8; 7];
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = stream.read_exact(&mut header) => read,
        };
        if read.is_err() {
            return;
        }
        if offline.load(Ordering::Acquire) {
            // Device went dark mid-session.
            return;
        }

        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        if length < 2 {
            return;
        }
        let mut pdu = vec![0u8; length - 1];
        if stream.read_exact(&mut pdu).await.is_err() {
            return;
        }
        request_count.fetch_add(1, Ordering::Relaxed);

        let response_pdu = handle_pdu(&pdu, &banks);

        let mut response = Vec::with_capacity(7 + response_pdu.len());
        response.extend_from_slice(&header[0..4]); // transaction + protocol id
        response.extend_from_slice(&((response_pdu.len() + 1) as u16).to_be_bytes());
        response.push(header[6]); // unit id
        response.extend_from_slice(&response_pdu);
        if stream.write_all(&response).await.is_err() {
            return;
        }
    }
}

fn exception(function: u8, code: u8) -> Vec<u8> {
    vec![function | 0x80, code]
}

fn handle_pdu(pdu: &[u8], banks: &Mutex<Banks>) -> Vec<u8> {
    let function = pdu[0];
    let mut banks = banks.lock().unwrap();

    match function {
        // Read coils / discrete inputs.
        0x01 | 0x02 => {
            if pdu.len() < 5 {
                return exception(function, 0x03);
            }
            let addr = u16::from_be_bytes([pdu[1], pdu[2]]) as usize;
            let count = u16::from_be_bytes([pdu[3], pdu[4]]) as usize;
            let bank = if function == 0x01 {
                &banks.coils
            } else {
                &banks.discrete
            };
            if count == 0 || addr + count > bank.len() {
                return exception(function, 0x02);
            }
            let mut bytes = vec![0u8; count.div_ceil(8)];
            for (i, bit) in bank[addr..addr + count].iter().enumerate() {
                if *bit {
                    bytes[i / 8] |= 1 << (i % 8);
                }
            }
            let mut out = vec![function, bytes.len() as u8];
            out.extend_from_slice(&bytes);
            out
        }
        // Read holding / input registers.
        0x03 | 0x04 => {
            if pdu.len() < 5 {
                return exception(function, 0x03);
            }
            let addr = u16::from_be_bytes([pdu[1], pdu[2]]) as usize;
            let count = u16::from_be_bytes([pdu[3], pdu[4]]) as usize;
            let bank = if function == 0x03 {
                &banks.holding
            } else {
                &banks.input
            };
            if count == 0 || count > 125 || addr + count > bank.len() {
                return exception(function, 0x02);
            }
            let mut out = vec![function, (count * 2) as u8];
            for word in &bank[addr..addr + count] {
                out.extend_from_slice(&word.to_be_bytes());
            }
            out
        }
        // Write single coil.
        0x05 => {
            if pdu.len() < 5 {
                return exception(function, 0x03);
            }
            let addr = u16::from_be_bytes([pdu[1], pdu[2]]) as usize;
            let raw = u16::from_be_bytes([pdu[3], pdu[4]]);
            if addr >= banks.coils.len() {
                return exception(function, 0x02);
            }
            if raw != 0x0000 && raw != 0xFF00 {
                return exception(function, 0x03);
            }
            banks.coils[addr] = raw == 0xFF00;
            pdu[..5].to_vec() // echo
        }
        // Write single register.
        0x06 => {
            if pdu.len() < 5 {
                return exception(function, 0x03);
            }
            let addr = u16::from_be_bytes([pdu[1], pdu[2]]) as usize;
            if addr >= banks.holding.len() {
                return exception(function, 0x02);
            }
            banks.holding[addr] = u16::from_be_bytes([pdu[3], pdu[4]]);
            pdu[..5].to_vec() // echo
        }
        // Write multiple coils.
        0x0F => {
            if pdu.len() < 6 {
                return exception(function, 0x03);
            }
            let addr = u16::from_be_bytes([pdu[1], pdu[2]]) as usize;
            let count = u16::from_be_bytes([pdu[3], pdu[4]]) as usize;
            if addr + count > banks.coils.len() || pdu.len() < 6 + count.div_ceil(8) {
                return exception(function, 0x02);
            }
            for i in 0..count {
                banks.coils[addr + i] = pdu[6 + i / 8] & (1 << (i % 8)) != 0;
            }
            let mut out = vec![function];
            out.extend_from_slice(&pdu[1..5]);
            out
        }
        // Write multiple registers.
        0x10 => {
            if pdu.len() < 6 {
                return exception(function, 0x03);
            }
            let addr = u16::from_be_bytes([pdu[1], pdu[2]]) as usize;
            let count = u16::from_be_bytes([pdu[3], pdu[4]]) as usize;
            if addr + count > banks.holding.len() || pdu.len() < 6 + count * 2 {
                return exception(function, 0x02);
            }
            for i in 0..count {
                banks.holding[addr + i] =
                    u16::from_be_bytes([pdu[6 + i * 2], pdu[7 + i * 2]]);
            }
            let mut out = vec![function];
            out.extend_from_slice(&pdu[1..5]);
            out
        }
        _ => exception(function, 0x01),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_holding_pdu() {
        let banks = Mutex::new(Banks::new());
        banks.lock().unwrap().holding[0] = 0x41C8;
        let response = handle_pdu(&[0x03, 0x00, 0x00, 0x00, 0x02], &banks);
        assert_eq!(response, vec![0x03, 0x04, 0x41, 0xC8, 0x00, 0x00]);
    }

    #[test]
    fn write_single_register_echoes() {
        let banks = Mutex::new(Banks::new());
        let response = handle_pdu(&[0x06, 0x00, 0x05, 0x42, 0x97], &banks);
        assert_eq!(response, vec![0x06, 0x00, 0x05, 0x42, 0x97]);
        assert_eq!(banks.lock().unwrap().holding[5], 0x4297);
    }

    #[test]
    fn out_of_range_read_is_an_exception() {
        let banks = Mutex::new(Banks::new());
        let response = handle_pdu(&[0x03, 0xFF, 0xFF, 0x00, 0x10], &banks);
        assert_eq!(response, vec![0x83, 0x02]);
    }

    #[test]
    fn coil_bits_pack_lsb_first() {
        let banks = Mutex::new(Banks::new());
        banks.lock().unwrap().coils[1] = true;
        banks.lock().unwrap().coils[3] = true;
        let response = handle_pdu(&[0x01, 0x00, 0x00, 0x00, 0x08], &banks);
        assert_eq!(response, vec![0x01, 0x01, 0b0000_1010]);
    }

    #[test]
    fn unsupported_function_is_rejected() {
        let banks = Mutex::new(Banks::new());
        let response = handle_pdu(&[0x2B, 0x00], &banks);
        assert_eq!(response, vec![0xAB, 0x01]);
    }
}
