//! Device contexts and gradient request types.

use std::fmt;
use std::str::FromStr;

/// Device kind, using the engine's numeric codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum DeviceType {
    Cpu = 1,
    Gpu = 2,
    CpuPinned = 3,
}

impl DeviceType {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(DeviceType::Cpu),
            2 => Some(DeviceType::Gpu),
            3 => Some(DeviceType::CpuPinned),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Where arrays live and executors run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Context {
    pub device_type: DeviceType,
    pub device_id: i32,
}

impl Context {
    pub fn new(device_type: DeviceType, device_id: i32) -> Self {
        Context {
            device_type,
            device_id,
        }
    }

    pub fn cpu() -> Self {
        Context::new(DeviceType::Cpu, 0)
    }

    pub fn gpu(device_id: i32) -> Self {
        Context::new(DeviceType::Gpu, device_id)
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::cpu()
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.device_type {
            DeviceType::Cpu => "cpu",
            DeviceType::Gpu => "gpu",
            DeviceType::CpuPinned => "cpu_pinned",
        };
        write!(f, "{}({})", kind, self.device_id)
    }
}

/// Error returned when a context or gradient request string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} '{input}'")]
pub struct ParseContextError {
    kind: &'static str,
    input: String,
}

impl ParseContextError {
    fn new(kind: &'static str, input: &str) -> Self {
        ParseContextError {
            kind,
            input: input.to_string(),
        }
    }
}

impl FromStr for Context {
    type Err = ParseContextError;

    /// Parses `"cpu"`, `"gpu(1)"` or `"cpu_pinned(0)"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (kind, id) = match s.split_once('(') {
            Some((kind, rest)) => {
                let id = rest
                    .strip_suffix(')')
                    .and_then(|id| id.trim().parse::<i32>().ok())
                    .filter(|id| *id >= 0)
                    .ok_or_else(|| ParseContextError::new("context", s))?;
                (kind.trim(), id)
            }
            None => (s, 0),
        };
        let device_type = match kind {
            "cpu" => DeviceType::Cpu,
            "gpu" => DeviceType::Gpu,
            "cpu_pinned" => DeviceType::CpuPinned,
            _ => return Err(ParseContextError::new("context", s)),
        };
        Ok(Context::new(device_type, id))
    }
}

/// How the executor writes a gradient array during backward.
///
/// Discriminants are the engine's wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum OpReqType {
    /// Leave the gradient array untouched.
    NullOp = 0,
    /// Overwrite the gradient array.
    WriteTo = 1,
    /// Accumulate into the gradient array.
    AddTo = 3,
}

impl OpReqType {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(OpReqType::NullOp),
            1 => Some(OpReqType::WriteTo),
            3 => Some(OpReqType::AddTo),
            _ => None,
        }
    }

    /// Request used when the caller does not name one: inputs and labels
    /// get no gradient, everything else is overwritten.
    pub fn default_for(arg_name: &str) -> Self {
        if arg_name.ends_with("data") || arg_name.ends_with("label") {
            OpReqType::NullOp
        } else {
            OpReqType::WriteTo
        }
    }
}

impl FromStr for OpReqType {
    type Err = ParseContextError;

    /// Parses `"null"`, `"write"` or `"add"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "null" => Ok(OpReqType::NullOp),
            "write" => Ok(OpReqType::WriteTo),
            "add" => Ok(OpReqType::AddTo),
            _ => Err(ParseContextError::new("gradient request", s)),
        }
    }
}
