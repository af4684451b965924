//! Temperature-dependent material property definitions.
//!
//! Every thermophysical and mechanical property is a piecewise-linear table of
//! temperature (°C) against value, clamped outside the table. Materials are
//! registered in a [`MaterialLibrary`] keyed by the element tag and validated
//! once at registration; lookups afterwards are pure.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Material identifier, equal to the element tag in the mesh.
pub type MaterialId = u32;

/// Piecewise-linear property table, clamped outside its temperature range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyCurve {
    /// Sample temperatures (°C), strictly increasing.
    pub temperatures: Vec<f64>,
    /// Property value at each sample temperature.
    pub values: Vec<f64>,
}

impl PropertyCurve {
    /// Create a curve from matching temperature and value samples.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMaterial`] if the table is empty, the lengths
    /// differ, the temperatures are not strictly increasing or any sample is
    /// non-finite.
    pub fn new(temperatures: Vec<f64>, values: Vec<f64>) -> Result<Self> {
        let curve = Self {
            temperatures,
            values,
        };
        curve.check_shape()?;
        Ok(curve)
    }

    /// Temperature-independent curve.
    pub fn constant(value: f64) -> Self {
        Self {
            temperatures: vec![0.0],
            values: vec![value],
        }
    }

    /// Build from `(temperature, value)` pairs.
    pub fn from_points(points: &[(f64, f64)]) -> Result<Self> {
        Self::new(
            points.iter().map(|p| p.0).collect(),
            points.iter().map(|p| p.1).collect(),
        )
    }

    fn check_shape(&self) -> Result<()> {
        if self.temperatures.is_empty() {
            return Err(Error::InvalidMaterial("property table is empty".into()));
        }
        if self.temperatures.len() != self.values.len() {
            return Err(Error::InvalidMaterial(format!(
                "property table has {} temperatures but {} values",
                self.temperatures.len(),
                self.values.len()
            )));
        }
        if self
            .temperatures
            .iter()
            .chain(self.values.iter())
            .any(|v| !v.is_finite())
        {
            return Err(Error::InvalidMaterial(
                "property table contains non-finite samples".into(),
            ));
        }
        if self.temperatures.windows(2).any(|w| w[1] <= w[0]) {
            return Err(Error::InvalidMaterial(
                "property table temperatures must be strictly increasing".into(),
            ));
        }
        Ok(())
    }

    /// Interpolated value at `temperature`.
    pub fn value(&self, temperature: f64) -> f64 {
        let t = &self.temperatures;
        let v = &self.values;
        let last = t.len() - 1;

        if temperature <= t[0] {
            return v[0];
        }
        if temperature >= t[last] {
            return v[last];
        }

        // First sample strictly above the query
        let hi = t.partition_point(|&s| s <= temperature);
        let lo = hi - 1;
        let s = (temperature - t[lo]) / (t[hi] - t[lo]);
        v[lo] + s * (v[hi] - v[lo])
    }

    /// Smallest sample value.
    pub fn min_value(&self) -> f64 {
        self.values.iter().copied().fold(f64::INFINITY, f64::min)
    }

    /// Largest sample value.
    pub fn max_value(&self) -> f64 {
        self.values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }
}

/// Temperature-dependent properties carried by every material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKind {
    /// Thermal conductivity k (W/m·K).
    Conductivity,
    /// Specific heat cp (J/kg·K), including any latent-heat peak.
    SpecificHeat,
    /// Mass density ρ (kg/m³).
    Density,
    /// Young's modulus E (Pa).
    YoungsModulus,
    /// Poisson's ratio ν.
    PoissonsRatio,
    /// Initial yield stress σy (Pa).
    YieldStress,
    /// Linear isotropic hardening modulus H (Pa).
    HardeningModulus,
    /// Secant thermal expansion coefficient α (1/K) relative to the reference temperature.
    ThermalExpansion,
}

impl PropertyKind {
    /// All property kinds, in declaration order.
    pub const ALL: [PropertyKind; 8] = [
        PropertyKind::Conductivity,
        PropertyKind::SpecificHeat,
        PropertyKind::Density,
        PropertyKind::YoungsModulus,
        PropertyKind::PoissonsRatio,
        PropertyKind::YieldStress,
        PropertyKind::HardeningModulus,
        PropertyKind::ThermalExpansion,
    ];
}

/// JMAK kinetics X = 1 − exp(−k(T)·tⁿ) for one diffusional product phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JmakKinetics {
    /// Rate coefficient k(T) (1/sⁿ); zero outside the transformation window.
    pub rate: PropertyCurve,
    /// Avrami exponent n.
    pub exponent: f64,
}

/// Volumetric dilatation of each phase relative to the initial microstructure.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseDilatation {
    pub austenite: f64,
    pub ferrite: f64,
    pub pearlite: f64,
    pub bainite: f64,
    pub martensite: f64,
}

/// Solid-state transformation parameters of a steel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformationData {
    /// Full austenitization temperature Ac3 (°C).
    pub austenitization_temperature: f64,
    /// Start of austenitization Ac1 (°C); `None` means a sharp switch at Ac3.
    #[serde(default)]
    pub austenite_start_temperature: Option<f64>,
    /// Martensite start temperature Ms (°C).
    pub martensite_start: f64,
    /// Koistinen–Marburger coefficient α_KM (1/K).
    pub km_coefficient: f64,
    #[serde(default)]
    pub ferrite: Option<JmakKinetics>,
    #[serde(default)]
    pub pearlite: Option<JmakKinetics>,
    #[serde(default)]
    pub bainite: Option<JmakKinetics>,
    #[serde(default)]
    pub dilatation: PhaseDilatation,
    /// Greenwood–Johnson transformation plasticity coefficient K (1/Pa).
    #[serde(default)]
    pub trip_coefficient: f64,
}

impl TransformationData {
    fn validate(&self) -> Result<()> {
        let ac3 = self.austenitization_temperature;
        let ms = self.martensite_start;
        if !ac3.is_finite() || !ms.is_finite() || ms >= ac3 {
            return Err(Error::InvalidMaterial(format!(
                "martensite start ({}) must lie below austenitization temperature ({})",
                ms, ac3
            )));
        }
        if let Some(ac1) = self.austenite_start_temperature {
            if !ac1.is_finite() || ac1 >= ac3 || ac1 <= ms {
                return Err(Error::InvalidMaterial(format!(
                    "Ac1 ({}) must lie between Ms ({}) and Ac3 ({})",
                    ac1, ms, ac3
                )));
            }
        }
        if !(self.km_coefficient > 0.0) {
            return Err(Error::InvalidMaterial(
                "Koistinen-Marburger coefficient must be positive".into(),
            ));
        }
        if !(self.trip_coefficient >= 0.0) {
            return Err(Error::InvalidMaterial(
                "transformation plasticity coefficient must be non-negative".into(),
            ));
        }
        let d = &self.dilatation;
        if ![d.austenite, d.ferrite, d.pearlite, d.bainite, d.martensite]
            .iter()
            .all(|v| v.is_finite())
        {
            return Err(Error::InvalidMaterial("phase dilatation must be finite".into()));
        }
        for (name, kinetics) in [
            ("ferrite", &self.ferrite),
            ("pearlite", &self.pearlite),
            ("bainite", &self.bainite),
        ] {
            if let Some(k) = kinetics {
                k.rate.check_shape()?;
                if !(k.exponent > 0.0) {
                    return Err(Error::InvalidMaterial(format!(
                        "{} JMAK exponent must be positive",
                        name
                    )));
                }
                if k.rate.min_value() < 0.0 {
                    return Err(Error::InvalidMaterial(format!(
                        "{} JMAK rate must be non-negative",
                        name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Temperature-dependent material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Material {
    #[serde(default)]
    pub name: String,
    pub conductivity: PropertyCurve,
    pub specific_heat: PropertyCurve,
    pub density: PropertyCurve,
    pub youngs_modulus: PropertyCurve,
    pub poissons_ratio: PropertyCurve,
    pub yield_stress: PropertyCurve,
    /// Defaults to zero (perfect plasticity).
    #[serde(default = "zero_curve")]
    pub hardening_modulus: PropertyCurve,
    pub thermal_expansion: PropertyCurve,
    /// Solid-state transformation data; `None` for non-transforming materials.
    #[serde(default)]
    pub transformation: Option<TransformationData>,
}

fn zero_curve() -> PropertyCurve {
    PropertyCurve::constant(0.0)
}

impl Material {
    /// Temperature-independent, non-transforming material.
    ///
    /// # Arguments
    ///
    /// * `conductivity` - k (W/m·K)
    /// * `specific_heat` - cp (J/kg·K)
    /// * `density` - ρ (kg/m³)
    /// * `youngs_modulus` - E (Pa)
    /// * `poissons_ratio` - ν
    /// * `yield_stress` - σy (Pa)
    /// * `thermal_expansion` - α (1/K)
    pub fn constant(
        conductivity: f64,
        specific_heat: f64,
        density: f64,
        youngs_modulus: f64,
        poissons_ratio: f64,
        yield_stress: f64,
        thermal_expansion: f64,
    ) -> Self {
        Self {
            name: String::from("constant"),
            conductivity: PropertyCurve::constant(conductivity),
            specific_heat: PropertyCurve::constant(specific_heat),
            density: PropertyCurve::constant(density),
            youngs_modulus: PropertyCurve::constant(youngs_modulus),
            poissons_ratio: PropertyCurve::constant(poissons_ratio),
            yield_stress: PropertyCurve::constant(yield_stress),
            hardening_modulus: zero_curve(),
            thermal_expansion: PropertyCurve::constant(thermal_expansion),
            transformation: None,
        }
    }

    /// Set the material name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Replace one property table.
    pub fn with_curve(mut self, kind: PropertyKind, curve: PropertyCurve) -> Self {
        *self.curve_mut(kind) = curve;
        self
    }

    /// Attach solid-state transformation data.
    pub fn with_transformation(mut self, data: TransformationData) -> Self {
        self.transformation = Some(data);
        self
    }

    /// The table backing a property.
    pub fn curve(&self, kind: PropertyKind) -> &PropertyCurve {
        match kind {
            PropertyKind::Conductivity => &self.conductivity,
            PropertyKind::SpecificHeat => &self.specific_heat,
            PropertyKind::Density => &self.density,
            PropertyKind::YoungsModulus => &self.youngs_modulus,
            PropertyKind::PoissonsRatio => &self.poissons_ratio,
            PropertyKind::YieldStress => &self.yield_stress,
            PropertyKind::HardeningModulus => &self.hardening_modulus,
            PropertyKind::ThermalExpansion => &self.thermal_expansion,
        }
    }

    fn curve_mut(&mut self, kind: PropertyKind) -> &mut PropertyCurve {
        match kind {
            PropertyKind::Conductivity => &mut self.conductivity,
            PropertyKind::SpecificHeat => &mut self.specific_heat,
            PropertyKind::Density => &mut self.density,
            PropertyKind::YoungsModulus => &mut self.youngs_modulus,
            PropertyKind::PoissonsRatio => &mut self.poissons_ratio,
            PropertyKind::YieldStress => &mut self.yield_stress,
            PropertyKind::HardeningModulus => &mut self.hardening_modulus,
            PropertyKind::ThermalExpansion => &mut self.thermal_expansion,
        }
    }

    /// Property value at `temperature` (°C).
    #[inline]
    pub fn property(&self, kind: PropertyKind, temperature: f64) -> f64 {
        self.curve(kind).value(temperature)
    }

    /// Shear modulus G = E / (2(1 + ν)) at `temperature`.
    pub fn shear_modulus(&self, temperature: f64) -> f64 {
        self.youngs_modulus.value(temperature)
            / (2.0 * (1.0 + self.poissons_ratio.value(temperature)))
    }

    /// Bulk modulus K = E / (3(1 - 2ν)) at `temperature`.
    pub fn bulk_modulus(&self, temperature: f64) -> f64 {
        self.youngs_modulus.value(temperature)
            / (3.0 * (1.0 - 2.0 * self.poissons_ratio.value(temperature)))
    }

    /// Check every table for shape and physical admissibility.
    pub fn validate(&self) -> Result<()> {
        for kind in PropertyKind::ALL {
            let curve = self.curve(kind);
            curve.check_shape().map_err(|e| {
                Error::InvalidMaterial(format!("{} {:?}: {}", self.name, kind, e))
            })?;

            let (min, max) = (curve.min_value(), curve.max_value());
            let admissible = match kind {
                PropertyKind::Conductivity
                | PropertyKind::SpecificHeat
                | PropertyKind::Density
                | PropertyKind::YoungsModulus
                | PropertyKind::YieldStress => min > 0.0,
                PropertyKind::PoissonsRatio => min > -1.0 && max < 0.5,
                PropertyKind::HardeningModulus => min >= 0.0,
                PropertyKind::ThermalExpansion => true,
            };
            if !admissible {
                return Err(Error::InvalidMaterial(format!(
                    "{}: {:?} outside its admissible range [{}, {}]",
                    self.name, kind, min, max
                )));
            }
        }

        if let Some(data) = &self.transformation {
            data.validate()?;
        }
        Ok(())
    }

    /// Low-carbon structural steel (S355-like) with transformation data.
    ///
    /// The specific-heat table carries an apparent peak around the solidus to
    /// represent latent heat of fusion.
    pub fn mild_steel() -> Self {
        // Literal tables, sorted by temperature.
        let curve = |points: &[(f64, f64)]| PropertyCurve {
            temperatures: points.iter().map(|p| p.0).collect(),
            values: points.iter().map(|p| p.1).collect(),
        };

        let transformation = TransformationData {
            austenitization_temperature: 850.0,
            austenite_start_temperature: Some(720.0),
            martensite_start: 420.0,
            km_coefficient: 0.011,
            ferrite: Some(JmakKinetics {
                rate: curve(&[(600.0, 0.0), (700.0, 0.06), (820.0, 0.0)]),
                exponent: 2.0,
            }),
            pearlite: Some(JmakKinetics {
                rate: curve(&[(550.0, 0.0), (620.0, 0.03), (700.0, 0.0)]),
                exponent: 2.0,
            }),
            bainite: Some(JmakKinetics {
                rate: curve(&[(420.0, 0.0), (480.0, 0.04), (550.0, 0.0)]),
                exponent: 2.0,
            }),
            dilatation: PhaseDilatation {
                austenite: -0.009,
                ferrite: 0.0,
                pearlite: 0.0,
                bainite: 0.006,
                martensite: 0.012,
            },
            trip_coefficient: 5e-11,
        };

        Self {
            name: String::from("mild_steel"),
            conductivity: curve(&[
                (20.0, 51.9),
                (400.0, 42.0),
                (800.0, 26.0),
                (1500.0, 32.0),
            ]),
            specific_heat: curve(&[
                (20.0, 450.0),
                (600.0, 760.0),
                (735.0, 1200.0),
                (800.0, 650.0),
                (1400.0, 650.0),
                (1480.0, 3000.0),
                (1530.0, 650.0),
            ]),
            density: curve(&[(20.0, 7850.0)]),
            youngs_modulus: curve(&[
                (20.0, 210e9),
                (600.0, 150e9),
                (800.0, 70e9),
                (1200.0, 10e9),
            ]),
            poissons_ratio: curve(&[(20.0, 0.3)]),
            yield_stress: curve(&[
                (20.0, 355e6),
                (400.0, 250e6),
                (700.0, 80e6),
                (1000.0, 20e6),
                (1200.0, 10e6),
            ]),
            hardening_modulus: curve(&[(20.0, 2e9), (800.0, 0.5e9), (1200.0, 0.1e9)]),
            thermal_expansion: curve(&[(20.0, 12e-6), (600.0, 14e-6), (1200.0, 15e-6)]),
            transformation: Some(transformation),
        }
    }
}

/// Materials keyed by element tag.
#[derive(Debug, Clone, Default)]
pub struct MaterialLibrary {
    materials: BTreeMap<MaterialId, Material>,
}

impl MaterialLibrary {
    /// Create an empty library.
    pub fn new() -> Self {
        Self::default()
    }

    /// Library with a single material registered under `id`.
    pub fn single(id: MaterialId, material: Material) -> Result<Self> {
        let mut library = Self::new();
        library.register(id, material)?;
        Ok(library)
    }

    /// Validate and register a material, replacing any previous entry.
    pub fn register(&mut self, id: MaterialId, material: Material) -> Result<()> {
        material.validate()?;
        self.materials.insert(id, material);
        Ok(())
    }

    /// Look up a material.
    pub fn get(&self, id: MaterialId) -> Result<&Material> {
        self.materials
            .get(&id)
            .ok_or_else(|| Error::InvalidMaterial(format!("no material registered for tag {}", id)))
    }

    /// True if `id` is registered.
    pub fn contains(&self, id: MaterialId) -> bool {
        self.materials.contains_key(&id)
    }

    /// Registered ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = MaterialId> + '_ {
        self.materials.keys().copied()
    }

    /// Property value for a registered material at `temperature` (°C).
    pub fn property_at(
        &self,
        id: MaterialId,
        kind: PropertyKind,
        temperature: f64,
    ) -> Result<f64> {
        Ok(self.get(id)?.property(kind, temperature))
    }

    /// Number of registered materials.
    pub fn len(&self) -> usize {
        self.materials.len()
    }

    /// True if no material is registered.
    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }
}
