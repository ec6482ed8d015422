use snafu::ensure;

use crate::{
  chunk::MAX_UNITS,
  error::{ConfigError, DescendingSnafu, OversizedSnafu, ZeroCeilingSnafu, ZeroGrowthSnafu},
};

/// Number of size-classed bins in front of the overflow list.
pub const BIN_COUNT: usize = 10;

/// Tunables of a [`Heap`](crate::Heap).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
  /// Inclusive unit-count ceiling of each bin, strictly ascending.
  pub(crate) bin_ceilings: [usize; BIN_COUNT],
  /// Smallest chunk, in units, requested from the grower at a time.
  pub(crate) min_growth_units: usize,
}

impl Config {
  pub const DEFAULT: Self = Self {
    bin_ceilings: [100, 200, 300, 400, 500, 600, 700, 800, 900, 1000],
    min_growth_units: 1024,
  };

  pub fn new(
    bin_ceilings: [usize; BIN_COUNT],
    min_growth_units: usize,
  ) -> Result<Self, ConfigError> {
    let mut previous = 0;
    for (index, &ceiling) in bin_ceilings.iter().enumerate() {
      ensure!(ceiling != 0, ZeroCeilingSnafu { index });
      ensure!(ceiling > previous, DescendingSnafu { index, ceiling });
      previous = ceiling;
    }

    ensure!(min_growth_units != 0, ZeroGrowthSnafu);
    ensure!(
      min_growth_units <= MAX_UNITS - 2,
      OversizedSnafu {
        units: min_growth_units
      }
    );

    Ok(Self {
      bin_ceilings,
      min_growth_units,
    })
  }

  pub fn bin_ceilings(&self) -> &[usize; BIN_COUNT] {
    &self.bin_ceilings
  }

  pub fn min_growth_units(&self) -> usize {
    self.min_growth_units
  }

  /// Lowest bin whose ceiling admits `units`, or `None` for the overflow list.
  pub fn bin_index(
    &self,
    units: usize,
  ) -> Option<usize> {
    self.bin_ceilings.iter().position(|&ceiling| units <= ceiling)
  }
}

impl Default for Config {
  fn default() -> Self {
    Self::DEFAULT
  }
}
