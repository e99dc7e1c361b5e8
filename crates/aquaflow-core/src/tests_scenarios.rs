#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::config::{GeneralParams, ScenarioConfig};
    use crate::controller::{ActuatorAction, ActuatorCommand, BoxError, ControlModule, ControlSnapshot, LinkState};
    use crate::controls::{Comparison, ThresholdControl};
    use crate::faults::SensorReadingEvent;
    use crate::leakage::LeakSpec;
    use crate::scada::ScadaData;
    use crate::sensor::{SensorConfig, SensorType};
    use crate::simulator::ScenarioSimulator;
    use crate::surrogate::{SurrogateLink, SurrogateNetwork, SurrogateNode, SurrogateSolver, TankGeometry};
    use crate::time::{TimeWindow, HOUR, MINUTE};
    use crate::uncertainty::{SensorNoise, UncertaintyKind};

    const HALF_HOUR: u64 = 30 * MINUTE;

    fn net() -> SurrogateNetwork {
        SurrogateNetwork::new(60.0)
            .with_node(SurrogateNode::junction("1", 10.0, 0.003))
            .with_node(SurrogateNode::junction("2", 12.0, 0.004))
            .with_node(SurrogateNode::junction("13", 8.0, 0.002).with_pattern("day"))
            .with_node(SurrogateNode::tank("T1", 30.0, TankGeometry { area: 40.0, initial_level: 2.0, max_level: 5.0 }))
            .with_link(SurrogateLink::pump("pump1", None, "1", 20.0))
            .with_link(SurrogateLink::pipe("p1", Some("1"), "2", 500.0, 0.25))
            .with_link(SurrogateLink::valve("v1", Some("2"), "13", 0.2))
            .with_link(SurrogateLink::pipe("p2", Some("1"), "T1", 300.0, 0.2))
            .with_pattern("day", vec![0.6, 0.8, 1.2, 1.5, 1.1, 0.7])
    }

    /// Two days at 30 minute hydraulic and reporting steps: 96 samples.
    fn simulator(sensors: SensorConfig) -> ScenarioSimulator<SurrogateSolver> {
        let network = net();
        let config = ScenarioConfig::new(
            GeneralParams::new(2 * 24 * HOUR, HALF_HOUR, HALF_HOUR),
            network.topology(),
            sensors,
        );
        ScenarioSimulator::new(config, SurrogateSolver::new(network).unwrap()).unwrap()
    }

    fn pressures(ids: &[&str]) -> SensorConfig {
        let mut s = SensorConfig::default();
        s.set_sensors(SensorType::Pressure, ids.iter().map(|id| id.to_string()).collect());
        s
    }

    fn column(data: &ScadaData, ty: &SensorType, id: &str, observed: bool) -> Vec<f64> {
        let m = if observed {
            data.get_observed_data(ty, Some(&[id][..])).unwrap()
        } else {
            data.get_raw_data(ty, Some(&[id][..])).unwrap()
        };
        m.column(0).iter().copied().collect()
    }

    #[test]
    fn override_scenario_sets_five_samples_and_clears_back_to_raw() {
        let mut sim = simulator(pressures(&["1", "13"]));
        let window = TimeWindow::new(5 * HOUR, 7 * HOUR).unwrap();
        sim.add_sensor_reading_attack(SensorReadingEvent::override_constant("1", SensorType::Pressure, window, 42.0))
            .unwrap();
        let mut data = sim.run().unwrap();
        assert_eq!(data.times().len(), 96);

        let raw = column(&data, &SensorType::Pressure, "1", false);
        let observed = data.get_data_pressures(Some(&["1"][..])).unwrap();
        assert_eq!(observed.nrows(), 96);
        for i in 0..96 {
            if (10..=14).contains(&i) {
                assert_eq!(observed[(i, 0)], 42.0);
            } else {
                assert_eq!(observed[(i, 0)].to_bits(), raw[i].to_bits(), "index {i}");
            }
        }
        // untouched sensor
        assert_eq!(column(&data, &SensorType::Pressure, "13", true), column(&data, &SensorType::Pressure, "13", false));

        data.clear_sensor_reading_events();
        let cleared = column(&data, &SensorType::Pressure, "1", true);
        assert!(cleared.iter().zip(&raw).all(|(a, b)| a.to_bits() == b.to_bits()));
    }

    #[test]
    fn replay_scenario_copies_source_samples() {
        let mut sim = simulator(pressures(&["13"]));
        let window = TimeWindow::new(5 * HOUR, 7 * HOUR).unwrap();
        let source = TimeWindow::new(0, 150 * MINUTE).unwrap();
        sim.add_sensor_reading_attack(SensorReadingEvent::replay("13", SensorType::Pressure, window, source))
            .unwrap();
        let data = sim.run().unwrap();

        let raw = column(&data, &SensorType::Pressure, "13", false);
        let observed = column(&data, &SensorType::Pressure, "13", true);
        for i in 0..5 {
            assert_eq!(observed[10 + i], raw[i]);
        }
        for i in (0..10).chain(15..96) {
            assert_eq!(observed[i], raw[i]);
        }
    }

    #[test]
    fn events_outside_their_window_leave_raw_values() {
        let mut sim = simulator(pressures(&["1", "2"]));
        let window = TimeWindow::new(20 * HOUR, 30 * HOUR).unwrap();
        sim.add_sensor_fault(SensorReadingEvent::drift("1", SensorType::Pressure, window, 1e-4)).unwrap();
        sim.add_sensor_fault(SensorReadingEvent::stuck_at("2", SensorType::Pressure, window)).unwrap();
        let data = sim.run().unwrap();

        let in_window: Vec<usize> = (0..96).filter(|&i| window.covers_sample(i as u64 * HALF_HOUR)).collect();
        assert_eq!(in_window, (40..=60).collect::<Vec<_>>());
        for id in ["1", "2"] {
            let raw = column(&data, &SensorType::Pressure, id, false);
            let observed = column(&data, &SensorType::Pressure, id, true);
            for i in (0..96).filter(|i| !in_window.contains(i)) {
                assert_eq!(observed[i], raw[i], "sensor {id} index {i}");
            }
        }
        let stuck = column(&data, &SensorType::Pressure, "2", true);
        assert!(stuck[40..=60].iter().all(|&v| v == stuck[40]));
    }

    struct Recorder(Rc<RefCell<Vec<u64>>>);

    impl ControlModule for Recorder {
        fn step(&mut self, s: &ControlSnapshot<'_>) -> Result<Vec<ActuatorCommand>, BoxError> {
            self.0.borrow_mut().push(s.time);
            Ok(Vec::new())
        }
    }

    struct Watcher(Rc<RefCell<Vec<(u64, f64, f64)>>>);

    impl ControlModule for Watcher {
        fn step(&mut self, s: &ControlSnapshot<'_>) -> Result<Vec<ActuatorCommand>, BoxError> {
            let seen = |id: &str| s.observed(&SensorType::Pressure, id).ok_or("missing reading");
            self.0.borrow_mut().push((s.time, seen("1")?, seen("13")?));
            Ok(Vec::new())
        }
    }

    #[test]
    fn controls_see_the_reported_observed_values() {
        let network = net();
        let config = ScenarioConfig::new(
            GeneralParams::new(24 * HOUR, HALF_HOUR, HOUR),
            network.topology(),
            pressures(&["1", "13"]),
        );
        let mut sim = ScenarioSimulator::new(config, SurrogateSolver::new(network).unwrap()).unwrap();
        let attack = TimeWindow::new(5 * HOUR, 7 * HOUR).unwrap();
        sim.add_sensor_reading_attack(SensorReadingEvent::override_sequence(
            "1",
            SensorType::Pressure,
            attack,
            vec![100.0, 200.0, 300.0],
        ))
        .unwrap();
        sim.add_sensor_fault(SensorReadingEvent::stuck_at(
            "13",
            SensorType::Pressure,
            TimeWindow::new(10 * HOUR, 14 * HOUR).unwrap(),
        ))
        .unwrap();
        sim.set_sensor_noise(SensorNoise::new(UncertaintyKind::AbsoluteGaussian { mean: 0.0, scale: 0.2 }, 17))
            .unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        sim.add_control(Box::new(Watcher(seen.clone()))).unwrap();
        let data = sim.run().unwrap();

        let p1 = column(&data, &SensorType::Pressure, "1", true);
        let p13 = column(&data, &SensorType::Pressure, "13", true);
        let seen = seen.borrow();
        assert_eq!(seen.len(), 48);
        for &(t, a, b) in seen.iter().filter(|(t, _, _)| t % HOUR == 0) {
            let i = (t / HOUR) as usize;
            assert_eq!(a.to_bits(), p1[i].to_bits(), "sensor 1 at {t}");
            assert_eq!(b.to_bits(), p13[i].to_bits(), "sensor 13 at {t}");
        }
        // between report samples the sequence holds its latest value
        let at = |t: u64| seen.iter().find(|s| s.0 == t).map(|s| s.1);
        assert_eq!(at(5 * HOUR + HALF_HOUR), Some(100.0));
        assert_eq!(at(6 * HOUR + HALF_HOUR), Some(200.0));
        assert_eq!(&p1[5..8], &[100.0, 200.0, 300.0]);
    }

    #[test]
    fn control_module_runs_once_per_hydraulic_step() {
        let times = Rc::new(RefCell::new(Vec::new()));
        let mut sim = simulator(pressures(&["1"]));
        sim.add_control(Box::new(Recorder(times.clone()))).unwrap();
        sim.run().unwrap();
        let times = times.borrow();
        assert_eq!(times.len(), 96);
        assert!(times.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(times[95], 2 * 24 * HOUR - HALF_HOUR);
    }

    struct Always(&'static str, ActuatorAction);

    impl ControlModule for Always {
        fn name(&self) -> &str {
            self.0
        }

        fn step(&mut self, _s: &ControlSnapshot<'_>) -> Result<Vec<ActuatorCommand>, BoxError> {
            Ok(vec![ActuatorCommand::new("v1", self.1)])
        }
    }

    fn valve_state_with(first: LinkState, second: LinkState) -> Vec<f64> {
        let mut sensors = SensorConfig::default();
        sensors.set_sensors(SensorType::ValveState, vec!["v1".into()]);
        let mut sim = simulator(sensors);
        sim.add_control(Box::new(Always("first", ActuatorAction::ValveState(first)))).unwrap();
        sim.add_control(Box::new(Always("second", ActuatorAction::ValveState(second)))).unwrap();
        let data = sim.run().unwrap();
        column(&data, &SensorType::ValveState, "v1", true)
    }

    #[test]
    fn later_registered_control_wins() {
        let open = valve_state_with(LinkState::Closed, LinkState::Open);
        assert!(open.iter().all(|&v| v == 1.0));
        let closed = valve_state_with(LinkState::Open, LinkState::Closed);
        // step 0 runs before any control output
        assert_eq!(closed[0], 1.0);
        assert!(closed[1..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn abrupt_leak_raises_demand_only_inside_window() {
        let mut sensors = SensorConfig::default();
        sensors.set_sensors(SensorType::Demand, vec!["2".into()]);
        let mut sim = simulator(sensors);
        let window = TimeWindow::new(10 * HOUR, 28 * HOUR).unwrap();
        sim.add_leakage(LeakSpec::abrupt("2", 0.001, window)).unwrap();
        let data = sim.run().unwrap();

        let demand = column(&data, &SensorType::Demand, "2", false);
        for (i, &t) in data.times().iter().enumerate() {
            if window.contains(t) {
                assert!(demand[i] > 4.0 + 1e-6, "t={t}");
            } else {
                assert!((demand[i] - 4.0).abs() < 1e-9, "t={t}");
            }
        }
        let active = data.get_events_active_time_points();
        assert_eq!(active.first(), Some(&(10 * HOUR)));
        assert_eq!(active.last(), Some(&(28 * HOUR - HALF_HOUR)));
        assert_eq!(active.len(), 36);
    }

    #[test]
    fn threshold_control_reacts_to_attacked_reading() {
        // the attack fakes a pressure collapse at node 13; the control shuts v1
        let mut sensors = pressures(&["13"]);
        sensors.set_sensors(SensorType::ValveState, vec!["v1".into()]);
        let mut sim = simulator(sensors);
        let window = TimeWindow::new(5 * HOUR, 7 * HOUR).unwrap();
        sim.add_sensor_reading_attack(SensorReadingEvent::override_constant("13", SensorType::Pressure, window, -1.0))
            .unwrap();
        sim.add_control(Box::new(ThresholdControl::new(
            "low-pressure-shutoff",
            SensorType::Pressure,
            "13",
            Comparison::Below,
            0.0,
            "v1",
            ActuatorAction::ValveState(LinkState::Closed),
        )))
        .unwrap();
        let data = sim.run().unwrap();
        let valve = column(&data, &SensorType::ValveState, "v1", false);
        assert!(valve[..=10].iter().all(|&v| v == 1.0));
        assert!(valve[11..].iter().all(|&v| v == 0.0));
    }

    const SCENARIO: &str = r#"
[general]
simulation_duration = 86400
hydraulic_time_step = 1800
reporting_time_step = 3600
seed = 11

[network]
nodes = ["1", "2", "13"]
links = ["p1", "p2"]
pumps = ["pump1"]
valves = ["v1"]
tanks = ["T1"]

[sensors]
pressure = ["1", "13"]
flow = ["p1"]
tank_volume = ["T1"]

[[sensor_reading_events]]
sensor_id = "1"
sensor_type = "pressure"
window = { start = 18000, end = 25200 }
kind = "override"
values = { constant = 42.0 }

[[leakages]]
type = "incipient"
location_id = "2"
peak_area = 0.002
peak_time = 50400
window = { start = 36000, end = 72000 }

[[actuator_events]]
time = 43200
actuator_id = "pump1"
action = "pump_speed"
value = 0.8
"#;

    #[test]
    fn declared_events_are_registered_and_run() {
        let config = ScenarioConfig::from_toml_str(SCENARIO).unwrap();
        let mut sim = ScenarioSimulator::new(config, SurrogateSolver::new(net()).unwrap()).unwrap();
        assert_eq!(sim.leakages().len(), 1);
        assert_eq!(sim.sensor_reading_events().len(), 1);
        assert_eq!(sim.actuator_events().len(), 1);

        let data = sim.run().unwrap();
        assert_eq!(data.times().len(), 24);
        let p1 = data.get_data_pressures(Some(&["1"][..])).unwrap();
        assert_eq!(p1[(5, 0)], 42.0);
        assert_eq!(p1[(7, 0)], 42.0);
        assert_ne!(p1[(8, 0)], 42.0);
        assert_eq!(sim.report().map(|r| r.seed), Some(11));
        assert_eq!(data.get_data_tanks_volume(None).unwrap().ncols(), 1);
    }
}
