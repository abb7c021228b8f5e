//! Control bus and outbound MMC

use super::Engine;
use crate::bus::{BusId, BusMode};
use crate::error::Result;
use crate::mmc::{Command, MmcCommand, SubCommand, MMC_ALL_CALL};
use log::{debug, warn};

pub const CONTROL_IN_BUS_NAME: &str = "Control In";
pub const CONTROL_OUT_BUS_NAME: &str = "Control Out";

impl Engine {
    /// Dedicated control buses carry MMC in both directions. Without them
    /// the default input and output buses are used.
    pub fn set_control_bus(&mut self, enabled: bool) -> Result<()> {
        let (control_in, control_out) = {
            let buses = self.shared.buses();
            (buses.control_in, buses.control_out)
        };
        if enabled {
            if control_in.is_none() {
                let id = self.add_bus(CONTROL_IN_BUS_NAME, BusMode::Input, false)?;
                self.shared.buses_mut().control_in = Some(id);
            }
            if control_out.is_none() {
                let id = self.add_bus(CONTROL_OUT_BUS_NAME, BusMode::Output, false)?;
                self.shared.buses_mut().control_out = Some(id);
            }
        } else {
            for id in [control_in, control_out].into_iter().flatten() {
                self.remove_bus(id)?;
            }
        }
        self.control_bus = enabled;
        self.settings.control_bus = enabled;
        Ok(())
    }

    pub fn is_control_bus(&self) -> bool {
        self.control_bus
    }

    /// Closes and reopens both control buses
    pub fn reset_control_bus(&mut self) -> Result<()> {
        let (control_in, control_out) = {
            let buses = self.shared.buses();
            (buses.control_in, buses.control_out)
        };
        if let Some(id) = control_in {
            self.reopen_bus(id, BusMode::Input)?;
        }
        if let Some(id) = control_out {
            self.reopen_bus(id, BusMode::Output)?;
        }
        Ok(())
    }

    pub fn control_bus_in(&self) -> Option<BusId> {
        let buses = self.shared.buses();
        buses.control_in.or_else(|| buses.default_input())
    }

    pub fn control_bus_out(&self) -> Option<BusId> {
        let buses = self.shared.buses();
        buses.control_out.or_else(|| buses.default_output())
    }

    /// Sends an MMC command right away on the control output bus
    pub fn send_mmc_command(&self, command: Command, data: &[u8]) -> bool {
        self.send_mmc(&MmcCommand::new(command, data))
    }

    /// Locate to `position`, counted in MMC time-code frames
    pub fn send_mmc_locate(&self, position: u32) -> bool {
        self.send_mmc(&MmcCommand::locate(position))
    }

    /// Sets or clears `track`'s bit of a track bitmap (record, mute, solo)
    pub fn send_mmc_masked_write(&self, sub: SubCommand, track: u32, on: bool) -> bool {
        self.send_mmc(&MmcCommand::masked_write(sub, track, on))
    }

    /// Sends straight through the bus. MMC never goes through the tick
    /// queue, so it is neither delayed by read-ahead nor discarded by a
    /// reposition.
    fn send_mmc(&self, mmc: &MmcCommand) -> bool {
        let Some(id) = self.control_bus_out() else {
            debug!("No control bus for MMC {:?}", mmc.command);
            return false;
        };
        let sysex = mmc.to_sysex(MMC_ALL_CALL);
        let result = self.shared.buses().get(id).map(|bus| bus.send_sysex(&sysex));
        match result {
            Some(Ok(())) => {
                debug!("MMC {:?} sent", mmc.command);
                true
            }
            Some(Err(e)) => {
                warn!("MMC {:?} not sent: {}", mmc.command, e);
                false
            }
            None => false,
        }
    }
}
