//! Scripted transports that stand in for a real MCU.
//!
//! Every write issued while the receive buffer is empty releases the next
//! scripted reply, which matches the strict request/response rhythm of the
//! BSL. An empty reply simulates a silent MCU.
use std::{
    cell::RefCell,
    collections::VecDeque,
    io::{Error as IoError, ErrorKind},
    rc::Rc,
    time::Duration,
};

use super::{ControlTransport, Parity, Transport};
use crate::constants::{PULSE_CALIBRATE, PULSE_SYNC};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct MockState {
    replies: VecDeque<Vec<u8>>,
    rx: VecDeque<u8>,
    /// Every `write_all` call, in order
    pub writes: Vec<Vec<u8>>,
    /// Every baud rate applied to the port, in order
    pub baud_rates: Vec<u32>,
    pub parities: Vec<Parity>,
    pub rts: Vec<bool>,
    pub dtr: Vec<bool>,
    pub delays: Vec<Duration>,
    pub closed: bool,
}

impl MockState {
    /// Writes that are not single-byte sync/calibration pulses.
    pub fn packets(&self) -> Vec<Vec<u8>> {
        self.writes
            .iter()
            .filter(|w| !is_pulse(w))
            .cloned()
            .collect()
    }
}

fn is_pulse(data: &[u8]) -> bool {
    data.len() == 1 && (data[0] == PULSE_SYNC || data[0] == PULSE_CALIBRATE)
}

/// Serial-port double driven by a reply script.
#[derive(Debug, Clone)]
pub struct MockPort {
    state: Rc<RefCell<MockState>>,
    baud_rate: u32,
}

impl MockPort {
    pub fn new<I>(replies: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let state = MockState {
            replies: replies.into_iter().collect(),
            ..Default::default()
        };
        MockPort {
            state: Rc::new(RefCell::new(state)),
            baud_rate: 0,
        }
    }

    /// Shared view of everything the protocol did to the port.
    pub fn state(&self) -> Rc<RefCell<MockState>> {
        Rc::clone(&self.state)
    }
}

impl Transport for MockPort {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.rx.len() < buf.len() {
            state.rx.clear();
            return Err(Error::Timeout("read timeout".into()));
        }
        for b in buf.iter_mut() {
            *b = state.rx.pop_front().unwrap_or_default();
        }
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return Err(IoError::new(ErrorKind::NotConnected, "port closed").into());
        }
        state.writes.push(data.to_vec());
        if state.rx.is_empty() {
            match state.replies.pop_front() {
                Some(reply) => state.rx.extend(reply),
                None if is_pulse(data) => {
                    return Err(IoError::new(ErrorKind::BrokenPipe, "mock script exhausted").into());
                }
                None => {}
            }
        }
        Ok(())
    }

    fn bytes_to_read(&mut self) -> Result<u32> {
        Ok(self.state.borrow().rx.len() as u32)
    }

    fn clear_input(&mut self) -> Result<()> {
        self.state.borrow_mut().rx.clear();
        Ok(())
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.baud_rate = baud_rate;
        self.state.borrow_mut().baud_rates.push(baud_rate);
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn set_parity(&mut self, parity: Parity) -> Result<()> {
        self.state.borrow_mut().parities.push(parity);
        Ok(())
    }

    fn set_timeouts(&mut self, _read: Duration, _inter_char: Duration) -> Result<()> {
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.state.borrow_mut().rts.push(level);
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.state.borrow_mut().dtr.push(level);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.state.borrow_mut().closed = true;
        Ok(())
    }

    fn delay(&mut self, duration: Duration) {
        self.state.borrow_mut().delays.push(duration);
    }
}

#[derive(Debug, Default)]
pub struct MockUsbState {
    replies: VecDeque<Vec<u8>>,
    /// `(request, value, index, data)` of every OUT transfer
    pub requests: Vec<(u8, u16, u16, Vec<u8>)>,
    pub delays: Vec<Duration>,
}

/// Control-transfer double: each IN transfer pops the next scripted reply.
#[derive(Debug, Clone)]
pub struct MockUsb {
    state: Rc<RefCell<MockUsbState>>,
}

impl MockUsb {
    pub fn new<I>(replies: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let state = MockUsbState {
            replies: replies.into_iter().collect(),
            ..Default::default()
        };
        MockUsb {
            state: Rc::new(RefCell::new(state)),
        }
    }

    pub fn state(&self) -> Rc<RefCell<MockUsbState>> {
        Rc::clone(&self.state)
    }
}

impl ControlTransport for MockUsb {
    fn control_in(&mut self, _request: u8, _value: u16, _index: u16, len: usize) -> Result<Vec<u8>> {
        let mut reply = self.state.borrow_mut().replies.pop_front().unwrap_or_default();
        reply.truncate(len);
        Ok(reply)
    }

    fn control_out(&mut self, request: u8, value: u16, index: u16, data: &[u8]) -> Result<()> {
        self.state
            .borrow_mut()
            .requests
            .push((request, value, index, data.to_vec()));
        Ok(())
    }

    fn delay(&mut self, duration: Duration) {
        self.state.borrow_mut().delays.push(duration);
    }
}
