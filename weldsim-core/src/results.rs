//! Result packaging.
//!
//! The [`ResultAssembler`] collects the output of every stage into one
//! [`ResultSet`]: named per-node and per-element arrays keyed by thermal step,
//! the convergence log and a handful of summary scalars.

use crate::error::FailureKind;
use crate::mechanical::MechanicalFrame;
use crate::mesh::Mesh;
use crate::metallurgy::{MetallurgyHistory, Phase};
use crate::thermal::TemperatureHistory;
use serde::Serialize;
use std::collections::BTreeMap;

/// Solver stage a convergence record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Thermal,
    Mechanical,
}

/// Convergence data of one accepted step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConvergenceRecord {
    pub stage: Stage,
    /// Thermal step index the record refers to.
    pub step: usize,
    /// Time at the end of the step (s).
    pub time: f64,
    /// Accepted timestep (thermal) or frame spacing (mechanical) (s).
    pub time_step: f64,
    /// Picard iterations (thermal) or Newton solves (mechanical).
    pub iterations: usize,
    /// Final temperature change (K) or relative residual.
    pub residual: f64,
    /// Timestep halvings or load bisections needed.
    pub cutbacks: usize,
}

/// Where a field lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FieldLocation {
    Node,
    Element,
}

/// A named array with `components` values per node or element.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamedField {
    pub name: String,
    pub location: FieldLocation,
    pub components: usize,
    pub values: Vec<f64>,
}

impl NamedField {
    pub fn nodal(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self::new(name, FieldLocation::Node, 1, values)
    }

    pub fn elemental(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self::new(name, FieldLocation::Element, 1, values)
    }

    pub fn new(
        name: impl Into<String>,
        location: FieldLocation,
        components: usize,
        values: Vec<f64>,
    ) -> Self {
        Self {
            name: name.into(),
            location,
            components,
            values,
        }
    }

    /// Number of nodes or elements covered.
    pub fn len(&self) -> usize {
        self.values.len() / self.components.max(1)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Components of entity `i`.
    pub fn get(&self, i: usize) -> &[f64] {
        &self.values[i * self.components..(i + 1) * self.components]
    }

    /// Largest scalar, or largest vector magnitude for multi-component fields.
    pub fn max_magnitude(&self) -> f64 {
        max_magnitude(&self.values, self.components)
    }
}

fn max_magnitude(values: &[f64], components: usize) -> f64 {
    if components <= 1 {
        values.iter().copied().fold(0.0, f64::max)
    } else {
        values
            .chunks(components)
            .map(|c| c.iter().map(|v| v * v).sum::<f64>().sqrt())
            .fold(0.0, f64::max)
    }
}

/// Every field recorded at one thermal step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldFrame {
    pub step: usize,
    pub time: f64,
    pub fields: Vec<NamedField>,
}

impl FieldFrame {
    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&NamedField> {
        self.fields.iter().find(|f| f.name == name)
    }

    fn insert(&mut self, field: NamedField) {
        match self.fields.iter_mut().find(|f| f.name == field.name) {
            Some(existing) => *existing = field,
            None => self.fields.push(field),
        }
    }
}

/// Scalars retrievable without touching the field arrays.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct SummaryScalars {
    /// Highest temperature reached anywhere (°C); zero before the first
    /// thermal frame.
    pub peak_temperature: f64,
    /// Highest element von Mises stress over all solved frames (Pa).
    pub max_von_mises: f64,
    /// Largest nodal displacement magnitude over all solved frames (m).
    pub max_displacement: f64,
    pub max_equivalent_plastic_strain: f64,
    /// Heat deposited by the source (J).
    pub energy_input: f64,
    pub thermal_steps: usize,
    pub mechanical_steps: usize,
}

/// Final state of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RunStatus {
    Completed,
    Failed { kind: FailureKind, message: String },
    Cancelled,
}

/// Everything a run produces.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultSet {
    pub frames: BTreeMap<usize, FieldFrame>,
    /// Peak temperature of every node over the whole transient.
    pub peak_temperature: Vec<f64>,
    pub convergence: Vec<ConvergenceRecord>,
    pub summary: SummaryScalars,
    pub status: RunStatus,
}

impl ResultSet {
    /// Frame recorded for a thermal step.
    pub fn frame(&self, step: usize) -> Option<&FieldFrame> {
        self.frames.get(&step)
    }

    /// Last recorded frame.
    pub fn last_frame(&self) -> Option<&FieldFrame> {
        self.frames.values().next_back()
    }

    /// Recorded step indices in ascending order.
    pub fn steps(&self) -> impl Iterator<Item = usize> + '_ {
        self.frames.keys().copied()
    }

    /// Field of one step.
    pub fn field(&self, step: usize, name: &str) -> Option<&NamedField> {
        self.frame(step).and_then(|f| f.field(name))
    }

    pub fn is_complete(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Extent along `axis` of the region whose peak temperature reached
    /// `threshold`, e.g. the heat-affected-zone width for the Ac1 threshold.
    ///
    /// Returns `None` when no node reached the threshold.
    pub fn extent_above(&self, mesh: &Mesh, threshold: f64, axis: usize) -> Option<f64> {
        let mut range: Option<(f64, f64)> = None;
        for (node, &peak) in self.peak_temperature.iter().enumerate() {
            if peak < threshold {
                continue;
            }
            let x = mesh.nodes()[node][axis];
            range = Some(match range {
                Some((lo, hi)) => (lo.min(x), hi.max(x)),
                None => (x, x),
            });
        }
        range.map(|(lo, hi)| hi - lo)
    }
}

/// Builds a [`ResultSet`] stage by stage.
#[derive(Debug, Clone, Default)]
pub struct ResultAssembler {
    stride: usize,
    frames: BTreeMap<usize, FieldFrame>,
    peak_temperature: Vec<f64>,
    convergence: Vec<ConvergenceRecord>,
    energy_input: f64,
    thermal_steps: usize,
    mechanical_steps: usize,
    max_von_mises: f64,
    max_displacement: f64,
    max_equivalent_plastic_strain: f64,
}

impl ResultAssembler {
    /// Keep every `stride`-th thermal step (the last step is always kept).
    pub fn new(stride: usize) -> Self {
        Self {
            stride: stride.max(1),
            ..Self::default()
        }
    }

    /// True if thermal step `step` of a transient with `last` as final step is kept.
    pub fn keeps(&self, step: usize, last: usize) -> bool {
        step % self.stride == 0 || step == last
    }

    pub fn record_convergence(&mut self, record: ConvergenceRecord) {
        match record.stage {
            Stage::Thermal => self.thermal_steps += 1,
            Stage::Mechanical => self.mechanical_steps += 1,
        }
        self.convergence.push(record);
    }

    pub fn set_energy_input(&mut self, energy: f64) {
        self.energy_input = energy;
    }

    /// Add temperature frames for the sampled steps and the peak field.
    pub fn record_temperatures(&mut self, history: &TemperatureHistory) {
        let last = history.n_frames().saturating_sub(1);
        for step in 0..history.n_frames() {
            if !self.keeps(step, last) {
                continue;
            }
            let frame = self.frames.entry(step).or_insert_with(|| FieldFrame {
                step,
                time: history.times()[step],
                fields: Vec::new(),
            });
            frame.insert(NamedField::nodal(
                "temperature",
                history.temperatures(step).to_vec(),
            ));
        }
        self.peak_temperature = history.peak_temperatures().to_vec();
    }

    /// Add phase fractions and transformation strain to the recorded frames.
    pub fn record_metallurgy(&mut self, metallurgy: &MetallurgyHistory) {
        for (&step, frame) in self.frames.iter_mut() {
            if step >= metallurgy.n_frames() {
                continue;
            }
            for phase in Phase::ALL {
                frame.insert(NamedField::nodal(
                    format!("phase.{}", phase.name()),
                    metallurgy.phase_field(step, phase),
                ));
            }
            frame.insert(NamedField::nodal(
                "transformation_strain",
                metallurgy.volumetric_strain(step).to_vec(),
            ));
        }
    }

    /// Fold one solved step into the summary maxima and add its mechanical
    /// fields if that step is recorded.
    pub fn record_mechanical(&mut self, step: usize, output: &MechanicalFrame) {
        self.max_von_mises = self
            .max_von_mises
            .max(max_magnitude(&output.von_mises, 1));
        self.max_displacement = self
            .max_displacement
            .max(max_magnitude(&output.displacement, 3));
        self.max_equivalent_plastic_strain = self
            .max_equivalent_plastic_strain
            .max(max_magnitude(&output.equivalent_plastic_strain, 1));

        let Some(frame) = self.frames.get_mut(&step) else {
            return;
        };
        frame.insert(NamedField::new(
            "displacement",
            FieldLocation::Node,
            3,
            output.displacement.clone(),
        ));
        frame.insert(NamedField::new(
            "stress",
            FieldLocation::Element,
            6,
            output.stress.iter().flat_map(|s| s.to_array()).collect(),
        ));
        frame.insert(NamedField::elemental("von_mises", output.von_mises.clone()));
        frame.insert(NamedField::nodal(
            "von_mises_nodal",
            output.nodal_von_mises.clone(),
        ));
        frame.insert(NamedField::elemental(
            "equivalent_plastic_strain",
            output.equivalent_plastic_strain.clone(),
        ));
    }

    /// Close the set with the given status.
    pub fn finish(self, status: RunStatus) -> ResultSet {
        let summary = SummaryScalars {
            peak_temperature: self
                .peak_temperature
                .iter()
                .copied()
                .reduce(f64::max)
                .unwrap_or(0.0),
            max_von_mises: self.max_von_mises,
            max_displacement: self.max_displacement,
            max_equivalent_plastic_strain: self.max_equivalent_plastic_strain,
            energy_input: self.energy_input,
            thermal_steps: self.thermal_steps,
            mechanical_steps: self.mechanical_steps,
        };

        ResultSet {
            frames: self.frames,
            peak_temperature: self.peak_temperature,
            convergence: self.convergence,
            summary,
            status,
        }
    }
}
