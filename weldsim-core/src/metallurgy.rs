//! Solid-state phase transformations driven by nodal temperature traces.
//!
//! Each node is integrated independently along its temperature history:
//!
//! - heating above Ac3 turns the node fully austenitic (partial austenitization
//!   between Ac1 and Ac3 follows the peak temperature linearly);
//! - on cooling, ferrite, pearlite and bainite grow from the austenite with
//!   JMAK kinetics made incremental by the additivity rule (fictitious time);
//! - below Ms the Koistinen–Marburger law converts the austenite left at Ms
//!   into martensite, driven by the lowest temperature reached.
//!
//! The volumetric transformation strain is the fraction-weighted phase
//! dilatation relative to the initial microstructure.

use crate::config::{MetallurgyConfig, ReheatPolicy};
use crate::error::{Error, Result};
use crate::material::{JmakKinetics, MaterialLibrary, TransformationData};
use crate::mesh::Mesh;
use crate::thermal::TemperatureHistory;
use log::{debug, info};
use rayon::prelude::*;
use rayon::ThreadPool;

/// Microstructural constituents tracked per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Initial (as-delivered) microstructure.
    Base,
    Austenite,
    Ferrite,
    Pearlite,
    Bainite,
    Martensite,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::Base,
        Phase::Austenite,
        Phase::Ferrite,
        Phase::Pearlite,
        Phase::Bainite,
        Phase::Martensite,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::Base => "base",
            Phase::Austenite => "austenite",
            Phase::Ferrite => "ferrite",
            Phase::Pearlite => "pearlite",
            Phase::Bainite => "bainite",
            Phase::Martensite => "martensite",
        }
    }
}

/// Volume fractions of every phase at one node; they sum to one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseFractions(pub [f64; 6]);

impl PhaseFractions {
    /// Untransformed base material.
    pub fn initial() -> Self {
        let mut f = [0.0; 6];
        f[Phase::Base.index()] = 1.0;
        Self(f)
    }

    pub fn get(&self, phase: Phase) -> f64 {
        self.0[phase.index()]
    }

    pub fn sum(&self) -> f64 {
        self.0.iter().sum()
    }

    fn set(&mut self, phase: Phase, value: f64) {
        self.0[phase.index()] = value;
    }

    /// Move `amount` from `from` to `to`.
    fn transfer(&mut self, from: Phase, to: Phase, amount: f64) {
        let amount = amount.clamp(0.0, self.get(from));
        self.0[from.index()] -= amount;
        self.0[to.index()] += amount;
    }

    /// Fraction-weighted volumetric dilatation.
    pub fn volumetric_strain(&self, data: &TransformationData) -> f64 {
        let d = &data.dilatation;
        self.get(Phase::Austenite) * d.austenite
            + self.get(Phase::Ferrite) * d.ferrite
            + self.get(Phase::Pearlite) * d.pearlite
            + self.get(Phase::Bainite) * d.bainite
            + self.get(Phase::Martensite) * d.martensite
    }
}

impl Default for PhaseFractions {
    fn default() -> Self {
        Self::initial()
    }
}

/// Diffusional products in the order they are integrated.
const DIFFUSIONAL: [Phase; 3] = [Phase::Ferrite, Phase::Pearlite, Phase::Bainite];

/// Largest JMAK progress that still has a finite fictitious time.
const PROGRESS_LIMIT: f64 = 1.0 - 1e-12;

/// Integration state of one node.
#[derive(Debug, Clone)]
struct NodeState {
    fractions: PhaseFractions,
    /// JMAK progress ξ of each diffusional product.
    progress: [f64; 3],
    /// Austenite present when the node first cooled through Ms.
    austenite_at_ms: Option<f64>,
    /// Lowest temperature reached since crossing Ms.
    min_below_ms: f64,
    /// Martensite formed since the last austenitization.
    martensite_formed: f64,
    /// Highest temperature reached.
    peak: f64,
}

impl NodeState {
    fn new(initial_temperature: f64) -> Self {
        Self {
            fractions: PhaseFractions::initial(),
            progress: [0.0; 3],
            austenite_at_ms: None,
            min_below_ms: f64::INFINITY,
            martensite_formed: 0.0,
            peak: initial_temperature,
        }
    }

    fn restart_transformation(&mut self) {
        self.progress = [0.0; 3];
        self.austenite_at_ms = None;
        self.min_below_ms = f64::INFINITY;
        self.martensite_formed = 0.0;
    }
}

/// Phase fractions and transformation strain at every node for every frame
/// of a [`TemperatureHistory`].
#[derive(Debug, Clone, PartialEq)]
pub struct MetallurgyHistory {
    times: Vec<f64>,
    fractions: Vec<Vec<PhaseFractions>>,
    volumetric_strain: Vec<Vec<f64>>,
}

impl MetallurgyHistory {
    /// History of a non-transforming part: base material and zero strain throughout.
    pub fn untransformed(times: &[f64], n_nodes: usize) -> Self {
        Self {
            times: times.to_vec(),
            fractions: vec![vec![PhaseFractions::initial(); n_nodes]; times.len()],
            volumetric_strain: vec![vec![0.0; n_nodes]; times.len()],
        }
    }

    pub fn n_frames(&self) -> usize {
        self.fractions.len()
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    /// Fractions of every node at one frame.
    pub fn fractions(&self, frame: usize) -> &[PhaseFractions] {
        &self.fractions[frame]
    }

    pub fn fraction(&self, frame: usize, node: usize, phase: Phase) -> f64 {
        self.fractions[frame][node].get(phase)
    }

    /// Nodal array of one phase at one frame.
    pub fn phase_field(&self, frame: usize, phase: Phase) -> Vec<f64> {
        self.fractions[frame].iter().map(|f| f.get(phase)).collect()
    }

    /// Nodal volumetric transformation strain at one frame.
    pub fn volumetric_strain(&self, frame: usize) -> &[f64] {
        &self.volumetric_strain[frame]
    }
}

/// Integrates phase transformations over a temperature history.
pub struct MetallurgyModel<'a> {
    config: &'a MetallurgyConfig,
    /// Transformation data of the material owning each node.
    node_data: Vec<Option<&'a TransformationData>>,
}

impl<'a> MetallurgyModel<'a> {
    /// Resolve each node's material: the first element (in mesh order) that
    /// references the node decides.
    pub fn new(
        mesh: &Mesh,
        materials: &'a MaterialLibrary,
        config: &'a MetallurgyConfig,
    ) -> Result<Self> {
        let mut node_data = vec![None; mesh.n_nodes()];
        let mut assigned = vec![false; mesh.n_nodes()];
        for element in mesh.elements() {
            let material = materials.get(element.tag)?;
            for &node in &element.nodes {
                if !assigned[node] {
                    assigned[node] = true;
                    node_data[node] = material.transformation.as_ref();
                }
            }
        }
        Ok(Self { config, node_data })
    }

    /// True if any node carries transformation data.
    pub fn is_transforming(&self) -> bool {
        self.node_data.iter().any(Option::is_some)
    }

    /// Integrate every node over the full history.
    ///
    /// Nodes are processed in parallel; results do not depend on the worker
    /// count. When several nodes fail, the lowest node index is reported.
    pub fn run(&self, history: &TemperatureHistory, pool: &ThreadPool) -> Result<MetallurgyHistory> {
        if history.n_nodes() != self.node_data.len() {
            return Err(Error::InvalidState(format!(
                "temperature history has {} nodes, mesh has {}",
                history.n_nodes(),
                self.node_data.len()
            )));
        }
        info!(
            "metallurgy: integrating {} nodes over {} frames",
            self.node_data.len(),
            history.n_frames()
        );

        let traces: Vec<Result<Vec<PhaseFractions>>> = pool.install(|| {
            (0..self.node_data.len())
                .into_par_iter()
                .map(|node| self.integrate_node(node, history))
                .collect()
        });

        let n_frames = history.n_frames();
        let n_nodes = self.node_data.len();
        let mut fractions = vec![vec![PhaseFractions::initial(); n_nodes]; n_frames];
        let mut volumetric_strain = vec![vec![0.0; n_nodes]; n_frames];
        for (node, trace) in traces.into_iter().enumerate() {
            let trace = trace?;
            for (frame, f) in trace.into_iter().enumerate() {
                if let Some(data) = self.node_data[node] {
                    volumetric_strain[frame][node] = f.volumetric_strain(data);
                }
                fractions[frame][node] = f;
            }
        }

        Ok(MetallurgyHistory {
            times: history.times().to_vec(),
            fractions,
            volumetric_strain,
        })
    }

    fn integrate_node(&self, node: usize, history: &TemperatureHistory) -> Result<Vec<PhaseFractions>> {
        let times = history.times();
        let mut trace = Vec::with_capacity(times.len());
        let mut previous = history.temperatures(0)[node];
        if !previous.is_finite() {
            return Err(invalid(node, format!("non-finite initial temperature {}", previous)));
        }

        let Some(data) = self.node_data[node] else {
            for frame in 0..times.len() {
                let t = history.temperatures(frame)[node];
                if !t.is_finite() {
                    return Err(invalid(node, format!("non-finite temperature at frame {}", frame)));
                }
            }
            trace.resize(times.len(), PhaseFractions::initial());
            return Ok(trace);
        };

        let mut state = NodeState::new(previous);
        trace.push(state.fractions);
        for frame in 1..times.len() {
            let dt = times[frame] - times[frame - 1];
            if !(dt > 0.0) {
                return Err(invalid(
                    node,
                    format!("times not strictly increasing at frame {}", frame),
                ));
            }
            let current = history.temperatures(frame)[node];
            if !current.is_finite() {
                return Err(invalid(node, format!("non-finite temperature at frame {}", frame)));
            }
            self.advance(node, data, &mut state, previous, current, dt)?;
            trace.push(state.fractions);
            previous = current;
        }

        if state.martensite_formed > 0.0 {
            debug!(
                "node {}: {:.3} martensite, peak {:.0} °C",
                node,
                state.fractions.get(Phase::Martensite),
                state.peak
            );
        }
        Ok(trace)
    }

    /// Advance one node over one step from `t_old` to `t_new` (°C).
    fn advance(
        &self,
        node: usize,
        data: &TransformationData,
        state: &mut NodeState,
        t_old: f64,
        t_new: f64,
        dt: f64,
    ) -> Result<()> {
        let ac3 = data.austenitization_temperature;
        let ms = data.martensite_start;
        let heating = t_new > t_old;
        let previous_peak = state.peak;
        state.peak = state.peak.max(t_new);

        if t_new >= ac3 {
            if state.fractions.get(Phase::Austenite) < 1.0 {
                state.fractions = PhaseFractions([0.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
            }
            state.restart_transformation();
            return Ok(());
        }

        if heating
            && state.fractions.get(Phase::Martensite) > 0.0
            && t_new > ms + self.config.reheat_tolerance
        {
            return match self.config.reheat_policy {
                ReheatPolicy::Freeze => Ok(()),
                ReheatPolicy::Reject => Err(invalid(
                    node,
                    format!(
                        "martensite reheated to {:.1} °C without reaching Ac3 ({:.1} °C)",
                        t_new, ac3
                    ),
                )),
            };
        }

        if heating {
            if let Some(ac1) = data.austenite_start_temperature {
                if t_new > ac1 && t_new > previous_peak {
                    self.austenitize_partially(state, (t_new - ac1) / (ac3 - ac1));
                }
            }
            return Ok(());
        }

        let t_mid = 0.5 * (t_old + t_new);
        for (slot, phase) in DIFFUSIONAL.iter().enumerate() {
            let kinetics = match phase {
                Phase::Ferrite => data.ferrite.as_ref(),
                Phase::Pearlite => data.pearlite.as_ref(),
                _ => data.bainite.as_ref(),
            };
            if let Some(kinetics) = kinetics {
                grow_diffusional(state, slot, *phase, kinetics, t_mid, dt);
            }
        }

        if t_new < ms {
            let available = *state
                .austenite_at_ms
                .get_or_insert(state.fractions.get(Phase::Austenite));
            state.min_below_ms = state.min_below_ms.min(t_new);
            let target = available * (1.0 - (-data.km_coefficient * (ms - state.min_below_ms)).exp());
            let increment = target - state.martensite_formed;
            if increment > 0.0 {
                let before = state.fractions.get(Phase::Martensite);
                state
                    .fractions
                    .transfer(Phase::Austenite, Phase::Martensite, increment);
                state.martensite_formed += state.fractions.get(Phase::Martensite) - before;
            }
        }
        Ok(())
    }

    /// Raise the austenite share to `share` of the node, consuming the other
    /// phases in proportion.
    fn austenitize_partially(&self, state: &mut NodeState, share: f64) {
        let share = share.clamp(0.0, 1.0);
        let austenite = state.fractions.get(Phase::Austenite);
        if share <= austenite {
            return;
        }
        let others = 1.0 - austenite;
        let keep = (1.0 - share) / others;
        for phase in Phase::ALL {
            if phase != Phase::Austenite {
                let f = state.fractions.get(phase);
                state.fractions.set(phase, f * keep);
            }
        }
        state.fractions.set(Phase::Austenite, share);
        state.restart_transformation();
    }
}

/// Grow one diffusional product from the austenite using the additivity rule.
fn grow_diffusional(
    state: &mut NodeState,
    slot: usize,
    phase: Phase,
    kinetics: &JmakKinetics,
    temperature: f64,
    dt: f64,
) {
    let austenite = state.fractions.get(Phase::Austenite);
    let rate = kinetics.rate.value(temperature);
    let xi = state.progress[slot];
    if austenite <= 0.0 || rate <= 0.0 || xi >= PROGRESS_LIMIT {
        return;
    }
    let n = kinetics.exponent;
    let fictitious = if xi > 0.0 {
        (-(1.0 - xi).ln() / rate).powf(1.0 / n)
    } else {
        0.0
    };
    let xi_new = (1.0 - (-rate * (fictitious + dt).powf(n)).exp()).min(PROGRESS_LIMIT);
    let formed = austenite * (xi_new - xi) / (1.0 - xi);
    state.fractions.transfer(Phase::Austenite, phase, formed);
    state.progress[slot] = xi_new;
}

fn invalid(node: usize, reason: String) -> Error {
    Error::InvalidThermalHistory { node, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::material::{Material, PropertyCurve};
    use crate::mesh::ElementType;
    use crate::types::Point3;
    use approx::assert_relative_eq;

    fn pool(threads: usize) -> ThreadPool {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .unwrap()
    }

    fn single_element() -> Mesh {
        Mesh::structured_box(Point3::zeros(), [1.0; 3], [1, 1, 1], ElementType::Hex8, 0).unwrap()
    }

    fn uniform_history(times: &[f64], temperatures: &[f64], n_nodes: usize) -> TemperatureHistory {
        TemperatureHistory::from_frames(
            times.to_vec(),
            temperatures.iter().map(|&t| vec![t; n_nodes]).collect(),
        )
        .unwrap()
    }

    fn steel_without_diffusion() -> MaterialLibrary {
        let mut steel = Material::mild_steel();
        if let Some(t) = steel.transformation.as_mut() {
            t.ferrite = None;
            t.pearlite = None;
            t.bainite = None;
        }
        MaterialLibrary::single(0, steel).unwrap()
    }

    fn run(
        library: &MaterialLibrary,
        config: &MetallurgyConfig,
        history: &TemperatureHistory,
    ) -> Result<MetallurgyHistory> {
        let mesh = single_element();
        let model = MetallurgyModel::new(&mesh, library, config)?;
        model.run(history, &pool(2))
    }

    #[test]
    fn test_quench_follows_koistinen_marburger() {
        let library = steel_without_diffusion();
        let config = MetallurgyConfig::default();
        let history = uniform_history(&[0.0, 1.0, 2.0, 3.0], &[20.0, 1000.0, 300.0, 20.0], 8);
        let result = run(&library, &config, &history).unwrap();

        assert_relative_eq!(result.fraction(1, 0, Phase::Austenite), 1.0);
        let data = library.get(0).unwrap().transformation.clone().unwrap();
        let expected =
            1.0 - (-data.km_coefficient * (data.martensite_start - 20.0)).exp();
        assert_relative_eq!(result.fraction(3, 0, Phase::Martensite), expected, epsilon = 1e-12);
        assert_relative_eq!(
            result.fraction(3, 0, Phase::Austenite),
            1.0 - expected,
            epsilon = 1e-12
        );
        assert_relative_eq!(
            result.volumetric_strain(3)[0],
            expected * data.dilatation.martensite + (1.0 - expected) * data.dilatation.austenite,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_fractions_stay_bounded_and_martensite_is_monotone() {
        let library = MaterialLibrary::single(0, Material::mild_steel()).unwrap();
        let config = MetallurgyConfig::default();
        let times: Vec<f64> = (0..=60).map(|i| i as f64).collect();
        let temperatures: Vec<f64> = times
            .iter()
            .map(|&t| if t <= 5.0 { 20.0 + 280.0 * t } else { 1420.0 * (-(t - 5.0) / 12.0).exp() + 20.0 })
            .collect();
        let history = uniform_history(&times, &temperatures, 8);
        let result = run(&library, &config, &history).unwrap();

        let mut last_martensite = 0.0;
        for frame in 0..result.n_frames() {
            let f = result.fractions(frame)[0];
            assert_relative_eq!(f.sum(), 1.0, epsilon = 1e-12);
            assert!(f.0.iter().all(|&v| (-1e-15..=1.0 + 1e-15).contains(&v)));
            if frame > 5 {
                let m = f.get(Phase::Martensite);
                assert!(m >= last_martensite - 1e-15);
                last_martensite = m;
            }
        }
        // Slow exponential cooling through the diffusional window
        let end = result.fractions(result.n_frames() - 1)[0];
        assert!(end.get(Phase::Ferrite) + end.get(Phase::Pearlite) + end.get(Phase::Bainite) > 0.0);
    }

    #[test]
    fn test_jmak_additivity_matches_isothermal_law() {
        let mut data = Material::mild_steel().transformation.unwrap();
        data.ferrite = Some(JmakKinetics {
            rate: PropertyCurve::constant(0.05),
            exponent: 2.0,
        });
        let mut state = NodeState::new(1000.0);
        state.fractions = PhaseFractions([0.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
        let kinetics = data.ferrite.as_ref().unwrap();
        for _ in 0..10 {
            grow_diffusional(&mut state, 0, Phase::Ferrite, kinetics, 700.0, 0.3);
        }
        // 10 steps of 0.3 s at constant temperature equal one 3 s interval
        let expected = 1.0 - (-0.05 * 3.0f64.powi(2)).exp();
        assert_relative_eq!(state.fractions.get(Phase::Ferrite), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_partial_austenitization() {
        let library = steel_without_diffusion();
        let config = MetallurgyConfig::default();
        let data = library.get(0).unwrap().transformation.clone().unwrap();
        let ac1 = data.austenite_start_temperature.unwrap();
        let ac3 = data.austenitization_temperature;
        let mid = 0.5 * (ac1 + ac3);
        let history = uniform_history(&[0.0, 1.0], &[20.0, mid], 8);
        let result = run(&library, &config, &history).unwrap();
        assert_relative_eq!(result.fraction(1, 0, Phase::Austenite), 0.5, epsilon = 1e-12);
        assert_relative_eq!(result.fraction(1, 0, Phase::Base), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_reheat_policy() {
        let library = steel_without_diffusion();
        let history = uniform_history(
            &[0.0, 1.0, 2.0, 3.0],
            &[20.0, 1000.0, 100.0, 600.0],
            8,
        );

        let freeze = MetallurgyConfig::default();
        let result = run(&library, &freeze, &history).unwrap();
        assert_eq!(result.fractions(2)[0], result.fractions(3)[0]);

        let reject = MetallurgyConfig {
            reheat_policy: ReheatPolicy::Reject,
            ..MetallurgyConfig::default()
        };
        let err = run(&library, &reject, &history).unwrap_err();
        assert!(matches!(err, Error::InvalidThermalHistory { node: 0, .. }));
    }

    #[test]
    fn test_invalid_traces() {
        let library = steel_without_diffusion();
        let config = MetallurgyConfig::default();

        let history = uniform_history(&[0.0, 1.0, 1.0], &[20.0, 500.0, 400.0], 8);
        assert!(matches!(
            run(&library, &config, &history),
            Err(Error::InvalidThermalHistory { .. })
        ));

        let history = uniform_history(&[0.0, 1.0], &[20.0, f64::NAN], 8);
        assert!(matches!(
            run(&library, &config, &history),
            Err(Error::InvalidThermalHistory { .. })
        ));
    }

    #[test]
    fn test_result_independent_of_worker_count() {
        let library = MaterialLibrary::single(0, Material::mild_steel()).unwrap();
        let config = MetallurgyConfig::default();
        let mesh = Mesh::structured_box(Point3::zeros(), [1.0; 3], [3, 3, 1], ElementType::Hex8, 0)
            .unwrap();
        let times: Vec<f64> = (0..=40).map(|i| i as f64 * 0.5).collect();
        let frames: Vec<Vec<f64>> = times
            .iter()
            .map(|&t| {
                mesh.nodes()
                    .iter()
                    .map(|p| 20.0 + 1500.0 * (-(t - 2.0 - p[0]).powi(2) / 4.0).exp())
                    .collect()
            })
            .collect();
        let history = TemperatureHistory::from_frames(times, frames).unwrap();
        let model = MetallurgyModel::new(&mesh, &library, &config).unwrap();
        let one = model.run(&history, &pool(1)).unwrap();
        let four = model.run(&history, &pool(4)).unwrap();
        assert_eq!(one, four);
    }
}
