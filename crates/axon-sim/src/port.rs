//! Focuser serial protocol
//!
//! Commands are bracketed (`[GPOS]`), replies parenthesized (`(1234)`).
//! Setters answer `(OK)`; the controller reports errors as `!<code>)`.

use axon_core::{LockError, ResourceBackend, ResourceLocks};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, trace};

/// Readings at or below this mean no temperature probe is attached
pub const NO_TEMPERATURE: f64 = -127.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PortError {
    #[error("Port I/O error: {0}")]
    Io(String),
    #[error("No reply to {command}")]
    Timeout { command: String },
    #[error("Malformed reply to {command}: {reply:?}")]
    Malformed { command: String, reply: String },
    #[error("{command} rejected with {reply}")]
    Rejected { command: String, reply: String },
}

/// Board identification from `[GFRM]`
#[derive(Debug, Clone, PartialEq)]
pub struct Firmware {
    pub board: String,
    pub version_text: String,
    /// Controller generation, 0 when the board is not recognised
    pub version: u8,
}

impl Firmware {
    fn parse(command: &str, body: &str) -> Result<Self, PortError> {
        let malformed = || PortError::Malformed {
            command: command.to_string(),
            reply: body.to_string(),
        };
        let (board, version_text) = body.split_once(',').ok_or_else(malformed)?;
        let board = board.trim().strip_prefix("Board=").ok_or_else(malformed)?;
        let version_text = version_text.trim().strip_prefix("Version=").ok_or_else(malformed)?;

        let version = ["AF1", "AF2", "AF3"]
            .iter()
            .position(|tag| board.contains(tag))
            .map(|i| i as u8 + 1)
            .unwrap_or(0);
        Ok(Self {
            board: board.to_string(),
            version_text: version_text.to_string(),
            version,
        })
    }
}

/// Strip the parentheses from a reply, mapping `!code)` to `Rejected`
fn reply_body<'a>(command: &str, reply: &'a str) -> Result<&'a str, PortError> {
    let reply = reply.trim();
    if reply.starts_with('!') {
        return Err(PortError::Rejected {
            command: command.to_string(),
            reply: reply.to_string(),
        });
    }
    reply
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| PortError::Malformed {
            command: command.to_string(),
            reply: reply.to_string(),
        })
}

fn parse_value<T: std::str::FromStr>(command: &str, reply: &str) -> Result<T, PortError> {
    let body = reply_body(command, reply)?;
    body.trim().parse().map_err(|_| PortError::Malformed {
        command: command.to_string(),
        reply: reply.to_string(),
    })
}

/// Serial link to a focuser controller
pub trait FocuserPort: Send + Sync {
    /// Send one command and return the raw reply
    fn transceive(&self, command: &str) -> Result<String, PortError>;

    fn query(&self, command: &str) -> Result<u32, PortError> {
        let reply = self.transceive(command)?;
        parse_value(command, &reply)
    }

    /// Send a setter and require `(OK)`
    fn set(&self, command: &str) -> Result<(), PortError> {
        let reply = self.transceive(command)?;
        if reply_body(command, &reply)? == "OK" {
            return Ok(());
        }
        Err(PortError::Rejected {
            command: command.to_string(),
            reply,
        })
    }

    fn firmware(&self) -> Result<Firmware, PortError> {
        let reply = self.transceive("[GFRM]")?;
        Firmware::parse("[GFRM]", reply_body("[GFRM]", &reply)?)
    }

    fn position(&self) -> Result<u32, PortError> {
        self.query("[GPOS]")
    }

    fn is_moving(&self) -> Result<bool, PortError> {
        Ok(self.query("[GMOV]")? != 0)
    }

    /// Set the target and start moving
    fn goto(&self, position: u32) -> Result<(), PortError> {
        self.set(&format!("[STRG{:06}]", position))?;
        self.transceive("[SMOV]").map(|_| ())
    }

    fn stop(&self) -> Result<(), PortError> {
        self.transceive("[STOP]").map(|_| ())
    }

    /// Redefine the current position without moving
    fn sync_position(&self, position: u32) -> Result<(), PortError> {
        self.set(&format!("[SPOS{:06}]", position))
    }

    fn speed(&self) -> Result<u32, PortError> {
        self.query("[GSPD]")
    }

    fn set_speed(&self, speed: u32) -> Result<(), PortError> {
        self.set(&format!("[SSPD{}]", speed))
    }

    fn set_reverse(&self, enabled: bool) -> Result<(), PortError> {
        self.set(&format!("[SREV{}]", u8::from(enabled)))
    }

    fn temperature(&self) -> Result<f64, PortError> {
        let reply = self.transceive("[GTMC]")?;
        parse_value("[GTMC]", &reply)
    }
}

/// Behaviour of a simulated controller
#[derive(Debug, Clone)]
pub struct ControllerModel {
    pub board: String,
    pub firmware: String,
    pub max_position: u32,
    /// Steps per second at speed 1
    pub base_rate: f64,
    /// `None` simulates a controller without a probe
    pub temperature: Option<f64>,
}

impl Default for ControllerModel {
    fn default() -> Self {
        Self {
            board: "DSD AF3".to_string(),
            firmware: "1.3.0".to_string(),
            max_position: 100_000,
            base_rate: 2_000.0,
            temperature: Some(12.5),
        }
    }
}

struct Motor {
    model: ControllerModel,
    position: f64,
    target: u32,
    pending: Option<u32>,
    moving_since: Option<Instant>,
    speed: u32,
    reverse: bool,
    failing: Vec<String>,
    muted: bool,
}

impl Motor {
    fn advance(&mut self) {
        let Some(since) = self.moving_since else {
            return;
        };
        let now = Instant::now();
        let budget = now.duration_since(since).as_secs_f64() * self.model.base_rate * self.speed as f64;
        let remaining = self.target as f64 - self.position;
        if remaining.abs() <= budget {
            self.position = self.target as f64;
            self.moving_since = None;
        } else {
            self.position += budget.copysign(remaining);
            self.moving_since = Some(now);
        }
    }

    fn handle(&mut self, command: &str) -> String {
        self.advance();
        let Some(inner) = command.strip_prefix('[').and_then(|c| c.strip_suffix(']')) else {
            return "!100)".to_string();
        };
        let (verb, arg) = inner.split_at(inner.len().min(4));
        let arg = arg.parse::<u32>().ok();

        match (verb, arg) {
            ("GFRM", _) => format!("(Board={}, Version={})", self.model.board, self.model.firmware),
            ("GPOS", _) => format!("({})", self.position.round() as u32),
            ("GMOV", _) => format!("({})", u8::from(self.moving_since.is_some())),
            ("GSPD", _) => format!("({})", self.speed),
            ("GTMC", _) => format!("({:.2})", self.model.temperature.unwrap_or(NO_TEMPERATURE)),
            ("STRG", Some(target)) if target <= self.model.max_position => {
                self.pending = Some(target);
                "(OK)".to_string()
            }
            ("STRG", Some(_)) => "!101)".to_string(),
            ("SMOV", _) => {
                if let Some(target) = self.pending.take() {
                    self.target = target;
                    self.moving_since = Some(Instant::now());
                }
                "(OK)".to_string()
            }
            ("STOP", _) => {
                self.moving_since = None;
                self.target = self.position.round() as u32;
                "(OK)".to_string()
            }
            ("SPOS", Some(position)) if position <= self.model.max_position => {
                self.moving_since = None;
                self.position = position as f64;
                self.target = position;
                "(OK)".to_string()
            }
            ("SSPD", Some(speed)) if (1..=5).contains(&speed) => {
                self.speed = speed;
                "(OK)".to_string()
            }
            ("SREV", Some(flag)) if flag <= 1 => {
                self.reverse = flag == 1;
                "(OK)".to_string()
            }
            _ => "!102)".to_string(),
        }
    }
}

/// In-process focuser controller answering the serial protocol
#[derive(Clone)]
pub struct SimulatedFocuserPort {
    motor: Arc<Mutex<Motor>>,
}

impl SimulatedFocuserPort {
    pub fn new(model: ControllerModel) -> Self {
        let start = model.max_position / 2;
        Self {
            motor: Arc::new(Mutex::new(Motor {
                model,
                position: start as f64,
                target: start,
                pending: None,
                moving_since: None,
                speed: 3,
                reverse: false,
                failing: Vec::new(),
                muted: false,
            })),
        }
    }

    /// Make every command starting with `prefix` fail with an I/O error
    pub fn fail_on(&self, prefix: &str) {
        self.motor.lock().failing.push(prefix.to_string());
    }

    pub fn clear_failures(&self) {
        let mut motor = self.motor.lock();
        motor.failing.clear();
        motor.muted = false;
    }

    /// Stop answering altogether
    pub fn mute(&self) {
        self.motor.lock().muted = true;
    }

    pub fn is_reversed(&self) -> bool {
        self.motor.lock().reverse
    }

    pub fn set_temperature(&self, temperature: Option<f64>) {
        self.motor.lock().model.temperature = temperature;
    }
}

impl FocuserPort for SimulatedFocuserPort {
    fn transceive(&self, command: &str) -> Result<String, PortError> {
        let mut motor = self.motor.lock();
        if motor.muted {
            return Err(PortError::Timeout {
                command: command.to_string(),
            });
        }
        if motor.failing.iter().any(|p| command.starts_with(p.as_str())) {
            return Err(PortError::Io(format!("write of {} failed", command)));
        }
        let reply = motor.handle(command);
        trace!(command, reply = %reply, "Focuser exchange");
        Ok(reply)
    }
}

/// Serial ports with a simulated controller behind each path
#[derive(Default)]
pub struct SerialPorts {
    ports: Mutex<HashMap<String, SimulatedFocuserPort>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

pub type PortLocks = ResourceLocks<Arc<SerialPorts>>;

impl SerialPorts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path_for(index: usize) -> String {
        format!("sim:dsd:{}", index)
    }

    /// Wire `port` to `path`, returning a handle the caller may use to steer it
    pub fn add(&self, path: &str, port: SimulatedFocuserPort) -> SimulatedFocuserPort {
        self.ports.lock().insert(path.to_string(), port.clone());
        port
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl ResourceBackend for SerialPorts {
    type Handle = SimulatedFocuserPort;

    fn open(&self, resource: &str) -> Result<SimulatedFocuserPort, LockError> {
        let port = self
            .ports
            .lock()
            .get(resource)
            .cloned()
            .ok_or_else(|| LockError::Open {
                resource: resource.to_string(),
                reason: "no such port".to_string(),
            })?;
        self.opens.fetch_add(1, Ordering::SeqCst);
        debug!(port = resource, "Serial port opened");
        Ok(port)
    }

    fn close(&self, resource: &str, _handle: Arc<SimulatedFocuserPort>) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        debug!(port = resource, "Serial port closed");
    }
}
