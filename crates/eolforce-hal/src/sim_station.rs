//! A complete simulated station: one of every driver from [`crate::sim`]
//! wired into a [`HardwareFacade`].
//!
//! ```no_run
//! # async fn demo() {
//! use eolforce_hal::sim_station::SimStation;
//!
//! let station = SimStation::builder().constant_force(20.0).build();
//! station.facade.connect_all().await;
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use eolforce_types::StationConfig;
use tokio::sync::Notify;

use crate::facade::HardwareFacade;
use crate::sim::{
    ForceScript, SimDigitalIo, SimLoadcell, SimMcu, SimPower, SimRobot, ThermalModel,
};

/// Handles to the facade and to every simulated driver behind it.
pub struct SimStation {
    pub config: StationConfig,
    pub facade: Arc<HardwareFacade>,
    pub robot: Arc<SimRobot>,
    pub power: Arc<SimPower>,
    pub mcu: Arc<SimMcu>,
    pub loadcell: Arc<SimLoadcell>,
    pub dio: Option<Arc<SimDigitalIo>>,
}

impl SimStation {
    pub fn builder() -> SimStationBuilder {
        SimStationBuilder::default()
    }
}

pub struct SimStationBuilder {
    config: StationConfig,
    force: ForceScript,
    capacity_n: f64,
    trigger: Option<(u32, u64, Arc<Notify>)>,
    thermal: ThermalModel,
    power_ramp: Duration,
    load_current: f64,
    homing_time: Duration,
    digital_io: bool,
}

impl Default for SimStationBuilder {
    fn default() -> Self {
        Self {
            config: StationConfig::default(),
            force: Arc::new(|_: u32, _: u64| 20.0),
            capacity_n: 1_000.0,
            trigger: None,
            thermal: ThermalModel::Track {
                settle: Duration::ZERO,
            },
            power_ramp: Duration::from_millis(100),
            load_current: 1.0,
            homing_time: Duration::from_millis(500),
            digital_io: true,
        }
    }
}

impl SimStationBuilder {
    pub fn config(mut self, config: StationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn constant_force(mut self, force_n: f64) -> Self {
        self.force = Arc::new(move |_: u32, _: u64| force_n);
        self
    }

    pub fn force_script(mut self, script: ForceScript) -> Self {
        self.force = script;
        self
    }

    /// Load cell full scale; readings beyond it saturate.
    pub fn capacity(mut self, capacity_n: f64) -> Self {
        self.capacity_n = capacity_n;
        self
    }

    /// Wake `notify` when sample `sample` of cycle `cycle` is streamed.
    pub fn notify_at(mut self, cycle: u32, sample: u64, notify: Arc<Notify>) -> Self {
        self.trigger = Some((cycle, sample, notify));
        self
    }

    pub fn thermal(mut self, model: ThermalModel) -> Self {
        self.thermal = model;
        self
    }

    pub fn power_ramp(mut self, ramp: Duration) -> Self {
        self.power_ramp = ramp;
        self
    }

    pub fn load_current(mut self, amps: f64) -> Self {
        self.load_current = amps;
        self
    }

    pub fn homing_time(mut self, homing_time: Duration) -> Self {
        self.homing_time = homing_time;
        self
    }

    /// Build a station without a digital I/O module.
    pub fn without_digital_io(mut self) -> Self {
        self.digital_io = false;
        self
    }

    /// Must be called inside a Tokio runtime.
    pub fn build(self) -> SimStation {
        let robot = SimRobot::new("robot", self.homing_time);
        let power = SimPower::new("power", self.power_ramp, self.load_current);
        let mcu = SimMcu::new("mcu", self.thermal);
        let mut loadcell = SimLoadcell::new("loadcell", self.force, self.capacity_n);
        if let Some((cycle, sample, notify)) = self.trigger {
            loadcell = loadcell.with_trigger(cycle, sample, notify);
        }
        let loadcell = Arc::new(loadcell);
        let dio = self.digital_io.then(|| SimDigitalIo::new("digital_io"));

        let mut builder = HardwareFacade::builder(self.config.clone())
            .power(power.clone())
            .robot(robot.clone())
            .mcu(mcu.clone())
            .loadcell(loadcell.clone());
        if let Some(dio) = &dio {
            builder = builder.digital_io(dio.clone());
        }

        SimStation {
            config: self.config,
            facade: builder.build(),
            robot,
            power,
            mcu,
            loadcell,
            dio,
        }
    }
}
