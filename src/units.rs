//! Physical quantities tagged with their unit.
//!
//! Everything crossing the public API carries its unit in a [`Quantity`]. Internally the crate
//! computes in kJ/mol, kelvin and picoseconds; conversion happens once, at the boundary.

use std::fmt;

/// A unit of one physical dimension
pub trait Unit: Copy + fmt::Debug + PartialEq {
    /// The unit internal computations use for this dimension
    const INTERNAL: Self;

    /// Factor converting a value in this unit into the internal unit
    fn factor(self) -> f64;

    /// Conventional symbol used when displaying quantities
    fn symbol(self) -> &'static str;
}

/// Temperature units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemperatureUnit {
    /// Kelvin
    Kelvin,
}

/// Molar energy units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnergyUnit {
    /// kJ/mol
    KilojoulePerMole,
    /// kcal/mol
    KilocaloriePerMole,
    /// J/mol
    JoulePerMole,
}

/// Molar energy per temperature; used for entropy, heat capacity and the Boltzmann constant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntropyUnit {
    /// kJ/(mol K)
    KilojoulePerMoleKelvin,
    /// kcal/(mol K)
    KilocaloriePerMoleKelvin,
    /// J/(mol K)
    JoulePerMoleKelvin,
}

/// Time units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    /// fs
    Femtosecond,
    /// ps
    Picosecond,
    /// ns
    Nanosecond,
}

/// Length units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthUnit {
    /// nm
    Nanometer,
    /// Å
    Angstrom,
}

/// Pure numbers such as fractions and probabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimensionless {
    /// Fraction of one
    Unity,
    /// Percent
    Percent,
}

const KJ_PER_KCAL: f64 = 4.184;

impl Unit for TemperatureUnit {
    const INTERNAL: Self = Self::Kelvin;

    fn factor(self) -> f64 {
        match self {
            Self::Kelvin => 1.0,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Kelvin => "K",
        }
    }
}

impl Unit for EnergyUnit {
    const INTERNAL: Self = Self::KilojoulePerMole;

    fn factor(self) -> f64 {
        match self {
            Self::KilojoulePerMole => 1.0,
            Self::KilocaloriePerMole => KJ_PER_KCAL,
            Self::JoulePerMole => 1.0e-3,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::KilojoulePerMole => "kJ/mol",
            Self::KilocaloriePerMole => "kcal/mol",
            Self::JoulePerMole => "J/mol",
        }
    }
}

impl Unit for EntropyUnit {
    const INTERNAL: Self = Self::KilojoulePerMoleKelvin;

    fn factor(self) -> f64 {
        match self {
            Self::KilojoulePerMoleKelvin => 1.0,
            Self::KilocaloriePerMoleKelvin => KJ_PER_KCAL,
            Self::JoulePerMoleKelvin => 1.0e-3,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::KilojoulePerMoleKelvin => "kJ/(mol K)",
            Self::KilocaloriePerMoleKelvin => "kcal/(mol K)",
            Self::JoulePerMoleKelvin => "J/(mol K)",
        }
    }
}

impl Unit for TimeUnit {
    const INTERNAL: Self = Self::Picosecond;

    fn factor(self) -> f64 {
        match self {
            Self::Femtosecond => 1.0e-3,
            Self::Picosecond => 1.0,
            Self::Nanosecond => 1.0e3,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Femtosecond => "fs",
            Self::Picosecond => "ps",
            Self::Nanosecond => "ns",
        }
    }
}

impl Unit for LengthUnit {
    const INTERNAL: Self = Self::Nanometer;

    fn factor(self) -> f64 {
        match self {
            Self::Nanometer => 1.0,
            Self::Angstrom => 0.1,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Nanometer => "nm",
            Self::Angstrom => "Å",
        }
    }
}

impl Unit for Dimensionless {
    const INTERNAL: Self = Self::Unity;

    fn factor(self) -> f64 {
        match self {
            Self::Unity => 1.0,
            Self::Percent => 0.01,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Unity => "",
            Self::Percent => "%",
        }
    }
}

/// A value together with the unit it is expressed in
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quantity<U: Unit> {
    value: f64,
    unit: U,
}

/// Temperature quantity
pub type Temperature = Quantity<TemperatureUnit>;
/// Molar energy quantity
pub type Energy = Quantity<EnergyUnit>;
/// Entropy or heat capacity quantity
pub type Entropy = Quantity<EntropyUnit>;
/// Time quantity
pub type Time = Quantity<TimeUnit>;
/// Length quantity
pub type Length = Quantity<LengthUnit>;

/// The molar gas constant, $k_B N_A$
pub const BOLTZMANN: Entropy = Quantity {
    value: 0.008_314_462_618,
    unit: EntropyUnit::KilojoulePerMoleKelvin,
};

impl<U: Unit> Quantity<U> {
    /// A new quantity of `value` in `unit`
    pub fn new(value: f64, unit: U) -> Self {
        Self { value, unit }
    }

    /// The bare number, in this quantity's own unit
    pub fn value(&self) -> f64 {
        self.value
    }

    /// The unit of this quantity
    pub fn unit(&self) -> U {
        self.unit
    }

    /// The bare number expressed in `unit`
    pub fn value_in(&self, unit: U) -> f64 {
        self.value * self.unit.factor() / unit.factor()
    }

    /// The same quantity expressed in `unit`
    pub fn to(&self, unit: U) -> Self {
        Self::new(self.value_in(unit), unit)
    }

    /// The bare number in the internal unit of this dimension
    pub(crate) fn internal(&self) -> f64 {
        self.value_in(U::INTERNAL)
    }

    /// Wrap a number already in the internal unit
    pub(crate) fn from_internal(value: f64) -> Self {
        Self::new(value, U::INTERNAL)
    }
}

impl<U: Unit> fmt::Display for Quantity<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.unit.symbol())
    }
}

/// Temperatures in kelvin
pub fn kelvin(value: f64) -> Temperature {
    Quantity::new(value, TemperatureUnit::Kelvin)
}

/// $k_B$ in the internal unit, kJ/(mol K)
pub(crate) fn kb() -> f64 {
    BOLTZMANN.internal()
}

/// A sequence of values aligned with some temperature grid, with their uncertainties
#[derive(Debug, Clone, PartialEq)]
pub struct ObservableSeries<U: Unit> {
    /// Values, in `unit`
    pub values: Vec<f64>,
    /// One-standard-deviation uncertainties, in `unit`
    pub uncertainties: Vec<f64>,
    /// Unit of both `values` and `uncertainties`
    pub unit: U,
}

impl<U: Unit> ObservableSeries<U> {
    /// A series of internal-unit values
    pub(crate) fn internal(values: Vec<f64>, uncertainties: Vec<f64>) -> Self {
        Self {
            values,
            uncertainties,
            unit: U::INTERNAL,
        }
    }

    /// Number of points
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if the series has no points
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The values expressed in `unit`
    pub fn values_in(&self, unit: U) -> Vec<f64> {
        let scale = self.unit.factor() / unit.factor();
        self.values.iter().map(|v| v * scale).collect()
    }

    /// The uncertainties expressed in `unit`
    pub fn uncertainties_in(&self, unit: U) -> Vec<f64> {
        let scale = self.unit.factor() / unit.factor();
        self.uncertainties.iter().map(|v| v * scale).collect()
    }

    /// The point at `index` as a pair of quantities
    pub fn get(&self, index: usize) -> Option<(Quantity<U>, Quantity<U>)> {
        let value = *self.values.get(index)?;
        let uncertainty = *self.uncertainties.get(index)?;
        Some((
            Quantity::new(value, self.unit),
            Quantity::new(uncertainty, self.unit),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn energy_conversions() {
        let e = Quantity::new(1.0, EnergyUnit::KilocaloriePerMole);
        assert!((e.value_in(EnergyUnit::KilojoulePerMole) - 4.184).abs() < 1e-12);
        assert!((e.value_in(EnergyUnit::JoulePerMole) - 4184.0).abs() < 1e-9);
        assert_eq!(e.to(EnergyUnit::KilojoulePerMole).unit(), EnergyUnit::KilojoulePerMole);
    }

    #[test]
    fn boltzmann_constant() {
        assert!((BOLTZMANN.value_in(EntropyUnit::JoulePerMoleKelvin) - 8.314462618).abs() < 1e-9);
        assert!((kb() * 300.0 - 2.494_338_785_4).abs() < 1e-9);
    }

    #[test]
    fn time_conversions() {
        let dt = Quantity::new(2.0, TimeUnit::Femtosecond);
        assert!((dt.internal() - 0.002).abs() < 1e-15);
        assert_eq!(format!("{}", dt), "2 fs");
    }

    #[test]
    fn length_and_fraction_conversions() {
        let cutoff = Quantity::new(12.0, LengthUnit::Angstrom);
        assert!((cutoff.internal() - 1.2).abs() < 1e-12);
        let q = Quantity::new(0.25, Dimensionless::Unity);
        assert!((q.value_in(Dimensionless::Percent) - 25.0).abs() < 1e-12);
    }

    #[test]
    fn series_conversion() {
        let series: ObservableSeries<EnergyUnit> =
            ObservableSeries::internal(vec![4.184, 8.368], vec![0.4184, 0.0]);
        let kcal = series.values_in(EnergyUnit::KilocaloriePerMole);
        assert!((kcal[0] - 1.0).abs() < 1e-12 && (kcal[1] - 2.0).abs() < 1e-12);
        let (value, sigma) = series.get(0).unwrap();
        assert!((sigma.value_in(EnergyUnit::KilocaloriePerMole) - 0.1).abs() < 1e-12);
        assert_eq!(value.unit(), EnergyUnit::KilojoulePerMole);
        assert!(series.get(2).is_none());
    }
}
