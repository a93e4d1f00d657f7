#![warn(rust_2018_idioms, missing_docs, missing_debug_implementations)]

//! Thermodynamics of coarse-grained folding from replica exchange simulations.
//!
//! Energies and configurational state labels from a replica exchange run are reweighted with
//! the multistate Bennett acceptance ratio (MBAR) onto a temperature ladder that may include
//! unsampled intermediate temperatures. From the reweighted ensemble this crate estimates
//! free energy differences between configurational states, their entropy and enthalpy
//! components, the heat capacity and its melting peak, and the expected fraction of native
//! contacts, with analytic or bootstrap uncertainties.
//!
//! Please reference the following if you use this code in your research:
//!
//! [1] Shirts MR and Chodera JD. Statistically optimal analysis of samples from multiple
//! equilibrium states. J. Chem. Phys. 129:124105, 2008. <http://dx.doi.org/10.1063/1.2978177>
//!
//! ```
//! use remd_thermo::testsystems::TwoStateModel;
//! use remd_thermo::units::kelvin;
//! use remd_thermo::{free_energy_profile, ProductionData, ReweightingSettings};
//!
//! let temperatures = vec![kelvin(300.0), kelvin(340.0)];
//! let model = TwoStateModel::from_ratios(temperatures[0], 2.0, temperatures[1], 0.5)?;
//! let (energies, labels) = model.sample_replicas(&temperatures, 200, 1)?;
//!
//! let settings = ReweightingSettings::builder()
//!     .temperatures(temperatures)
//!     .num_intermediate_states(3)
//!     .build()?;
//! let data = settings.align(&energies, &labels)?;
//! let profile = free_energy_profile(&data, &settings)?;
//! let folding = profile.get(0, 1).expect("both states are populated");
//! assert_eq!(folding.len(), 5);
//! # Ok::<(), remd_thermo::ThermoError>(())
//! ```

#[macro_use]
extern crate derive_builder;

pub mod bootstrap;
pub mod driver;
pub mod energies;
/// Error type shared by every fallible operation
pub mod errors;
pub mod free_energy;
pub mod heat_capacity;
pub mod ladder;
/// Native multistate Bennett acceptance ratio estimator
pub mod mbar;
pub mod native_contacts;
pub mod reweight;
pub mod spline;
pub mod testsystems;
pub mod units;

pub use bootstrap::{bootstrap_free_energy, bootstrap_heat_capacity, BootstrapSettings};
pub use driver::{
    replica_exchange, EngineExit, ReplicaExchangeDriver, ReplicaExchangeEngine,
    ReplicaExchangePlan, RunState, SimulationSettings,
};
pub use energies::{LabelAlignment, ProductionData, ProductionWindow, ReplicaEnergies, StateLabels};
pub use errors::{Result, ThermoError};
pub use free_energy::{
    free_energy_profile, ConformationalOccupancy, EntropyEnthalpy, FreeEnergyProfile,
    TransitionKey,
};
pub use heat_capacity::{
    heat_capacity, heat_capacity_reevaluated, CvPeak, HeatCapacity, HeatCapacityMethod,
    HeatCapacitySettings, ReevaluatedHeatCapacity,
};
pub use ladder::TemperatureLadder;
pub use mbar::{InitialFreeEnergies, MBar, UncertaintyMethod};
pub use native_contacts::{default_cutoffs, native_contact_expectation, CutoffScan, NativeContacts};
pub use reweight::{Parameters, Reweighting, ReweightingSettings, StateObservable};
