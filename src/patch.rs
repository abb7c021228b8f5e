//! Per-channel instrument state

/// How a bank number is transmitted before a program change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankSelMethod {
    /// CC#0 (MSB) followed by CC#32 (LSB)
    Normal,
    /// CC#0 only
    MsbOnly,
    /// CC#32 only
    LsbOnly,
}

impl BankSelMethod {
    pub fn from_index(index: i32) -> Option<Self> {
        match index {
            0 => Some(BankSelMethod::Normal),
            1 => Some(BankSelMethod::MsbOnly),
            2 => Some(BankSelMethod::LsbOnly),
            _ => None,
        }
    }

    pub fn index(self) -> i32 {
        match self {
            BankSelMethod::Normal => 0,
            BankSelMethod::MsbOnly => 1,
            BankSelMethod::LsbOnly => 2,
        }
    }
}

/// Instrument, bank and program selection for one channel.
/// `None` fields are never transmitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Patch {
    pub instrument_name: String,
    pub bank_sel_method: Option<BankSelMethod>,
    pub bank: Option<u16>,
    pub prog: Option<u8>,
}

impl Patch {
    pub fn is_unset(&self) -> bool {
        self.instrument_name.is_empty()
            && self.bank_sel_method.is_none()
            && self.bank.is_none()
            && self.prog.is_none()
    }

    /// Controller/program messages selecting this patch on `channel`
    pub fn select_messages(&self, channel: u8) -> Vec<Vec<u8>> {
        let status_cc = 0xB0 | (channel & 0x0F);
        let mut messages = Vec::with_capacity(3);

        if let Some(bank) = self.bank {
            let msb = ((bank >> 7) & 0x7F) as u8;
            let lsb = (bank & 0x7F) as u8;
            match self.bank_sel_method.unwrap_or(BankSelMethod::Normal) {
                BankSelMethod::Normal => {
                    messages.push(vec![status_cc, 0x00, msb]);
                    messages.push(vec![status_cc, 0x20, lsb]);
                }
                BankSelMethod::MsbOnly => messages.push(vec![status_cc, 0x00, lsb]),
                BankSelMethod::LsbOnly => messages.push(vec![status_cc, 0x20, lsb]),
            }
        }

        if let Some(prog) = self.prog {
            messages.push(vec![0xC0 | (channel & 0x0F), prog & 0x7F]);
        }

        messages
    }
}
