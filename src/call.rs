//! RPC call values and their wire encoding.

use rmp::encode::{self, ValueWriteError};

use crate::error::{Error, Result};

/// A call to one worker RPC function.
///
/// Context sub-calls are state mutations the worker applies in order
/// before the main call; the worker processes the whole tuple
/// atomically. `args` holds already-encoded msgpack argument bytes and
/// is passed through verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Call {
    pub ctx: Vec<CtxCall>,
    pub func: u8,
    pub args: Vec<u8>,
}

/// A context sub-call executed before the main call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CtxCall {
    pub func: u8,
    pub args: Vec<u8>,
}

impl Call {
    pub fn new(func: u8) -> Self {
        Self {
            func,
            ..Self::default()
        }
    }

    pub fn with_args(func: u8, args: Vec<u8>) -> Self {
        Self {
            ctx: Vec::new(),
            func,
            args,
        }
    }

    /// Appends a context sub-call, keeping application order.
    pub fn push_ctx(mut self, func: u8, args: Vec<u8>) -> Self {
        self.ctx.push(CtxCall { func, args });
        self
    }

    /// Encodes the call as the worker wire tuple
    /// `[[ctx...], func, args]`. Empty argument bytes encode as nil.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(8 + self.args.len());

        encode::write_array_len(&mut buf, 3).map_err(write_err)?;
        encode::write_array_len(&mut buf, self.ctx.len() as u32).map_err(write_err)?;
        for ctx in &self.ctx {
            encode::write_array_len(&mut buf, 2).map_err(write_err)?;
            encode::write_uint(&mut buf, u64::from(ctx.func)).map_err(write_err)?;
            write_raw_args(&mut buf, &ctx.args)?;
        }

        encode::write_uint(&mut buf, u64::from(self.func)).map_err(write_err)?;
        write_raw_args(&mut buf, &self.args)?;

        Ok(buf)
    }
}

fn write_raw_args(buf: &mut Vec<u8>, args: &[u8]) -> Result<()> {
    if args.is_empty() {
        buf.extend_from_slice(&rmp_serde::to_vec(&())?);
    } else {
        buf.extend_from_slice(args);
    }

    Ok(())
}

fn write_err(e: ValueWriteError) -> Error {
    match e {
        ValueWriteError::InvalidMarkerWrite(err) | ValueWriteError::InvalidDataWrite(err) => {
            Error::Io(err)
        }
    }
}
