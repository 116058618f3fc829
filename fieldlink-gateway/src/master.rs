//! Serial bus master.
//!
//! The executor talks to the bus through [`MasterConnector`] and
//! [`ProtocolMaster`]; [`RtuConnector`] is the tokio-modbus RTU implementation.

use std::time::Duration;

use async_trait::async_trait;
use tokio_modbus::client::{Context, Reader};
use tokio_modbus::prelude::*;

use crate::document::{Access, Parity, PortConfig};
use crate::scheduler::RequestDescriptor;

/// Failure of a single bus request.
///
/// The split decides how hard the executor's error count is hit: a protocol
/// error concerns one request, a transport error means the line itself is gone.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MasterError {
    #[error("{0}")]
    Protocol(String),
    #[error("serial line failure: {0}")]
    Transport(String),
}

impl MasterError {
    pub fn is_transport(&self) -> bool {
        matches!(self, MasterError::Transport(_))
    }
}

/// An open bus master.
#[async_trait]
pub trait ProtocolMaster: Send {
    /// Run one request. Reads return the values, writes return `[address, value]`.
    async fn execute(&mut self, request: &RequestDescriptor) -> Result<Vec<u16>, MasterError>;

    /// Release the serial line.
    async fn close(&mut self);
}

/// Opens masters for a port configuration.
#[async_trait]
pub trait MasterConnector: Send + Sync {
    async fn open(&self, port: &PortConfig) -> Result<Box<dyn ProtocolMaster>, MasterError>;
}

/// Modbus RTU over a local serial port.
#[derive(Debug, Default, Clone)]
pub struct RtuConnector;

#[async_trait]
impl MasterConnector for RtuConnector {
    async fn open(&self, port: &PortConfig) -> Result<Box<dyn ProtocolMaster>, MasterError> {
        let (data_bits, parity, stop_bits) = serial_settings(port)?;

        let builder = tokio_serial::new(&port.port, port.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(port.timeout());

        let serial = tokio_serial::SerialStream::open(&builder).map_err(|e| {
            MasterError::Transport(format!("failed to open {}: {}", port.port, e))
        })?;

        tracing::info!(port = %port.port, baud_rate = port.baud_rate, "Serial line opened");

        Ok(Box::new(RtuMaster {
            ctx: Some(rtu::attach(serial)),
            timeout: port.timeout(),
        }))
    }
}

/// Map document settings onto the driver's types.
///
/// Mark/space parity and 1.5 stop bits cannot be expressed by the driver
/// and fail the open.
fn serial_settings(
    port: &PortConfig,
) -> Result<
    (
        tokio_serial::DataBits,
        tokio_serial::Parity,
        tokio_serial::StopBits,
    ),
    MasterError,
> {
    let data_bits = match port.data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        8 => tokio_serial::DataBits::Eight,
        other => {
            return Err(MasterError::Transport(format!(
                "unsupported data bits {}",
                other
            )));
        }
    };

    let parity = match port.parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::Mark | Parity::Space => {
            return Err(MasterError::Transport(format!(
                "parity {} is not supported by the serial driver",
                port.parity.letter()
            )));
        }
    };

    let stop_bits = if port.stop_bits == 1.0 {
        tokio_serial::StopBits::One
    } else if port.stop_bits == 2.0 {
        tokio_serial::StopBits::Two
    } else {
        return Err(MasterError::Transport(format!(
            "{} stop bits are not supported by the serial driver",
            port.stop_bits
        )));
    };

    Ok((data_bits, parity, stop_bits))
}

struct RtuMaster {
    ctx: Option<Context>,
    timeout: Duration,
}

#[async_trait]
impl ProtocolMaster for RtuMaster {
    async fn execute(&mut self, request: &RequestDescriptor) -> Result<Vec<u16>, MasterError> {
        let ctx = self
            .ctx
            .as_mut()
            .ok_or_else(|| MasterError::Transport("serial line closed".to_string()))?;

        let slave = u8::try_from(request.slave_id).map_err(|_| {
            MasterError::Protocol(format!("slave id {} is not addressable", request.slave_id))
        })?;
        ctx.set_slave(Slave(slave));

        match tokio::time::timeout(self.timeout, dispatch(ctx, request)).await {
            Ok(result) => result,
            Err(_) => Err(MasterError::Protocol(format!(
                "no response within {:?}",
                self.timeout
            ))),
        }
    }

    async fn close(&mut self) {
        if self.ctx.take().is_some() {
            tracing::debug!("Serial line closed");
        }
    }
}

async fn dispatch(ctx: &mut Context, request: &RequestDescriptor) -> Result<Vec<u16>, MasterError> {
    let address = request.start_address;

    match (request.function_code, request.access) {
        (1, Access::Read { quantity }) => {
            classify(ctx.read_coils(address, quantity).await).map(bits)
        }
        (2, Access::Read { quantity }) => {
            classify(ctx.read_discrete_inputs(address, quantity).await).map(bits)
        }
        (3, Access::Read { quantity }) => {
            classify(ctx.read_holding_registers(address, quantity).await)
        }
        (4, Access::Read { quantity }) => {
            classify(ctx.read_input_registers(address, quantity).await)
        }
        (5, Access::Write { value }) => {
            classify(ctx.write_single_coil(address, value != 0).await)?;
            Ok(vec![address, value])
        }
        (6, Access::Write { value }) => {
            classify(ctx.write_single_register(address, value).await)?;
            Ok(vec![address, value])
        }
        (15, Access::Write { value }) => {
            classify(ctx.write_multiple_coils(address, &[value != 0]).await)?;
            Ok(vec![address, value])
        }
        (16, Access::Write { value }) => {
            classify(ctx.write_multiple_registers(address, &[value]).await)?;
            Ok(vec![address, value])
        }
        (code, access) => Err(MasterError::Protocol(format!(
            "function code {} is not supported for {}",
            code,
            match access {
                Access::Read { .. } => "reads",
                Access::Write { .. } => "writes",
            }
        ))),
    }
}

/// Split driver errors: line failures are transport errors, everything
/// else (framing, exceptions) concerns just this request.
fn classify<T>(result: tokio_modbus::Result<T>) -> Result<T, MasterError> {
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(exception)) => Err(MasterError::Protocol(format!(
            "device exception {:?}",
            exception
        ))),
        Err(tokio_modbus::Error::Transport(e)) => Err(MasterError::Transport(e.to_string())),
        Err(e) => Err(MasterError::Protocol(e.to_string())),
    }
}

fn bits(values: Vec<bool>) -> Vec<u16> {
    values.into_iter().map(u16::from).collect()
}
