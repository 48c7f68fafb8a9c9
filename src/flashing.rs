//! Session orchestration: connect, program and always disconnect.
use crate::{
    Error, Result,
    progress::ProgressSink,
    protocol::{McuInfo, Protocol, ResetStrategy},
};

/// Images are padded with erased bytes to a multiple of this.
const IMAGE_ALIGN: usize = 512;
const ERASED: u8 = 0xff;

/// What to do once connected.
#[derive(Debug, Clone, Default)]
pub struct FlashPlan {
    pub code: Option<Vec<u8>>,
    /// Placed right after the code area
    pub eeprom: Option<Vec<u8>>,
    /// Erase the whole array even without an image
    pub erase: bool,
    /// `(name, value)` pairs applied before programming
    pub options: Vec<(String, String)>,
}

impl FlashPlan {
    /// Parse a `name=value` option argument.
    pub fn push_option(&mut self, arg: &str) -> Result<()> {
        let (name, value) = arg
            .split_once('=')
            .ok_or_else(|| Error::InvalidOption(format!("invalid option '{arg}' (incorrect format)")))?;
        self.options.push((name.trim().to_string(), value.trim().to_string()));
        Ok(())
    }
}

pub struct Flashing {
    protocol: Box<dyn Protocol>,
    connected: bool,
}

impl Flashing {
    pub fn new(protocol: Box<dyn Protocol>) -> Self {
        Flashing {
            protocol,
            connected: false,
        }
    }

    pub fn protocol(&self) -> &dyn Protocol {
        self.protocol.as_ref()
    }

    /// Wait for the MCU and decode its status. A failed attempt still
    /// resets the target and releases the port.
    pub fn connect(&mut self, reset: &ResetStrategy) -> Result<&McuInfo> {
        if let Err(e) = self.protocol.connect(reset) {
            if let Err(d) = self.protocol.disconnect() {
                log::debug!("Disconnect after failed connect: {}", d);
            }
            return Err(e);
        }
        self.connected = true;
        log::info!("Protocol: {}", self.protocol.family());
        self.protocol
            .mcu_info()
            .ok_or_else(|| Error::protocol("no MCU information after connecting"))
    }

    /// Run `plan` and disconnect, whether or not the plan succeeded.
    pub fn run(&mut self, plan: &FlashPlan, progress: &mut dyn ProgressSink) -> Result<()> {
        if !self.connected {
            return Err(Error::protocol("not connected to a target"));
        }
        let result = self.execute(plan, progress);
        let disconnected = self.disconnect();
        result?;
        disconnected
    }

    pub fn disconnect(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        self.protocol.disconnect()
    }

    fn execute(&mut self, plan: &FlashPlan, progress: &mut dyn ProgressSink) -> Result<()> {
        for (name, value) in &plan.options {
            self.protocol.set_option(name, value)?;
        }

        let model = self
            .protocol
            .mcu_info()
            .map(|info| info.model.clone())
            .ok_or_else(|| Error::protocol("not connected to a target"))?;

        match &plan.code {
            Some(code) => {
                let (code_size, eeprom_size) = match self.protocol.memory_split() {
                    Some(split) if model.iap => split,
                    _ => (model.code, model.eeprom),
                };
                let image = build_image(
                    code,
                    plan.eeprom.as_deref(),
                    code_size as usize,
                    eeprom_size as usize,
                );
                self.protocol.handshake()?;
                self.protocol.erase_flash(image.len(), code_size as usize)?;
                self.protocol.program_flash(&image, progress)?;
                self.protocol.program_options()?;
            }
            None if plan.erase => {
                let total = model.total as usize;
                self.protocol.handshake()?;
                self.protocol.erase_flash(total, total)?;
                if !plan.options.is_empty() {
                    self.protocol.program_options()?;
                }
            }
            None if !plan.options.is_empty() => {
                log::warn!("Options are only written together with an image or an erase");
            }
            None => {}
        }
        Ok(())
    }
}

/// Lay out the code image, padded to the alignment, followed by the EEPROM
/// image at `code_size`.
pub fn build_image(code: &[u8], eeprom: Option<&[u8]>, code_size: usize, eeprom_size: usize) -> Vec<u8> {
    if code.len() > code_size {
        log::warn!("Code image exceeds program memory size ({} > {})", code.len(), code_size);
    }
    let mut image = code.to_vec();
    if let Some(eeprom) = eeprom {
        if eeprom.len() > eeprom_size {
            log::warn!("EEPROM image exceeds EEPROM size ({} > {})", eeprom.len(), eeprom_size);
        }
        if image.len() < code_size {
            image.resize(code_size, ERASED);
        }
        image.extend_from_slice(eeprom);
    }
    let aligned = image.len().div_ceil(IMAGE_ALIGN) * IMAGE_ALIGN;
    image.resize(aligned, ERASED);
    image
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Family, McuModel};
    use crate::options::OptionSet;
    use std::{cell::RefCell, rc::Rc};

    #[derive(Default)]
    struct Calls(Vec<String>);

    /// Protocol double that records the lifecycle calls.
    struct Recorder {
        calls: Rc<RefCell<Calls>>,
        info: McuInfo,
        split: Option<(u32, u32)>,
        fail_on: Option<&'static str>,
    }

    impl Recorder {
        fn new(model: McuModel) -> (Self, Rc<RefCell<Calls>>) {
            let calls = Rc::new(RefCell::new(Calls::default()));
            let recorder = Recorder {
                calls: Rc::clone(&calls),
                info: McuInfo::new(model, 11_059_200.0, "7.2.5T".into(), 0x72),
                split: None,
                fail_on: None,
            };
            (recorder, calls)
        }

        fn record(&self, call: String) -> Result<()> {
            let failed = self.fail_on.is_some_and(|f| call.starts_with(f));
            self.calls.borrow_mut().0.push(call);
            if failed {
                Err(Error::protocol("scripted failure"))
            } else {
                Ok(())
            }
        }
    }

    impl Protocol for Recorder {
        fn family(&self) -> Family {
            Family::Stc15
        }
        fn connect(&mut self, _reset: &ResetStrategy) -> Result<()> {
            self.record("connect".into())
        }
        fn handshake(&mut self) -> Result<()> {
            self.record("handshake".into())
        }
        fn erase_flash(&mut self, erase_size: usize, flash_size: usize) -> Result<()> {
            self.record(format!("erase {erase_size} {flash_size}"))
        }
        fn program_flash(&mut self, data: &[u8], progress: &mut dyn ProgressSink) -> Result<()> {
            progress.progress(data.len(), 64, data.len());
            self.record(format!("program {}", data.len()))
        }
        fn set_option(&mut self, name: &str, value: &str) -> Result<()> {
            self.record(format!("option {name}={value}"))
        }
        fn program_options(&mut self) -> Result<()> {
            self.record("options".into())
        }
        fn disconnect(&mut self) -> Result<()> {
            self.record("disconnect".into())
        }
        fn mcu_info(&self) -> Option<&McuInfo> {
            Some(&self.info)
        }
        fn uid(&self) -> Option<&[u8]> {
            None
        }
        fn options(&self) -> Option<&dyn OptionSet> {
            None
        }
        fn memory_split(&self) -> Option<(u32, u32)> {
            self.split
        }
    }

    fn model(iap: bool) -> McuModel {
        McuModel {
            name: "STC15F2K60S2".into(),
            magic: 0xf449,
            total: 63488,
            code: 61440,
            eeprom: 1024,
            iap,
            mcs251: false,
        }
    }

    fn calls(calls: &Rc<RefCell<Calls>>) -> Vec<String> {
        calls.borrow().0.clone()
    }

    #[test]
    fn image_is_padded_and_eeprom_follows_code() {
        let image = build_image(&[1; 100], None, 4096, 1024);
        assert_eq!(image.len(), 512);
        assert_eq!(image[99], 1);
        assert_eq!(image[100], 0xff);

        let image = build_image(&[1; 100], Some(&[2; 10]), 4096, 1024);
        assert_eq!(image.len(), 4608);
        assert_eq!(image[4095], 0xff);
        assert_eq!(image[4096], 2);
        assert_eq!(image[4106], 0xff);
    }

    #[test]
    fn program_flow_runs_in_order() {
        let (recorder, log) = Recorder::new(model(false));
        let mut flashing = Flashing::new(Box::new(recorder));
        flashing.connect(&ResetStrategy::Manual).unwrap();

        let mut plan = FlashPlan {
            code: Some(vec![0; 600]),
            ..Default::default()
        };
        plan.push_option("reset_pin_enabled = true").unwrap();
        let mut reported = Vec::new();
        let mut sink = |c: usize, _: usize, t: usize| reported.push((c, t));
        flashing.run(&plan, &mut sink).unwrap();

        assert_eq!(
            calls(&log),
            vec![
                "connect",
                "option reset_pin_enabled=true",
                "handshake",
                "erase 1024 61440",
                "program 1024",
                "options",
                "disconnect",
            ]
        );
        assert_eq!(reported, vec![(1024, 1024)]);
    }

    #[test]
    fn split_moves_the_eeprom_image() {
        let (mut recorder, log) = Recorder::new(model(true));
        recorder.split = Some((8192, 55296));
        let mut flashing = Flashing::new(Box::new(recorder));
        flashing.connect(&ResetStrategy::Manual).unwrap();
        let plan = FlashPlan {
            code: Some(vec![0; 16]),
            eeprom: Some(vec![0; 16]),
            ..Default::default()
        };
        flashing.run(&plan, &mut crate::progress::NoProgress).unwrap();
        assert!(calls(&log).contains(&"erase 8704 8192".to_string()));
    }

    #[test]
    fn failures_still_disconnect() {
        let (mut recorder, log) = Recorder::new(model(false));
        recorder.fail_on = Some("erase");
        let mut flashing = Flashing::new(Box::new(recorder));
        flashing.connect(&ResetStrategy::Manual).unwrap();
        let plan = FlashPlan {
            erase: true,
            ..Default::default()
        };
        let err = flashing.run(&plan, &mut crate::progress::NoProgress);
        assert!(matches!(err, Err(Error::Protocol(_))));
        assert_eq!(
            calls(&log),
            vec!["connect", "handshake", "erase 63488 63488", "disconnect"]
        );
        // a second disconnect is a no-op
        flashing.disconnect().unwrap();
        assert_eq!(calls(&log).len(), 4);
    }

    #[test]
    fn failed_connect_disconnects() {
        let (mut recorder, log) = Recorder::new(model(false));
        recorder.fail_on = Some("connect");
        let mut flashing = Flashing::new(Box::new(recorder));
        assert!(flashing.connect(&ResetStrategy::Manual).is_err());
        assert_eq!(calls(&log), vec!["connect", "disconnect"]);
        // nothing is left to release
        flashing.disconnect().unwrap();
        assert_eq!(calls(&log).len(), 2);
    }

    #[test]
    fn run_requires_connect() {
        let (recorder, log) = Recorder::new(model(false));
        let mut flashing = Flashing::new(Box::new(recorder));
        assert!(flashing.run(&FlashPlan::default(), &mut crate::progress::NoProgress).is_err());
        assert!(calls(&log).is_empty());
    }

    #[test]
    fn malformed_option_is_rejected() {
        let mut plan = FlashPlan::default();
        assert!(matches!(plan.push_option("watchdog"), Err(Error::InvalidOption(_))));
    }
}
