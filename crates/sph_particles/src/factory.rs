//! User-supplied particle construction.

use crate::array::ParticleArray;

/// Boxed error returned by a failing factory.
pub type FactoryFailure = Box<dyn std::error::Error + Send + Sync>;

/// Whether a factory should produce real particles or empty placeholders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayFill {
    /// Full initial data. Only the coordinating rank asks for this.
    Populated,
    /// Same names, kinds, and fields as the populated set, zero particles.
    Empty,
}

/// Builds the initial particle arrays of a run.
///
/// Every rank calls the factory exactly once (unless the coordinating rank
/// restarts from a checkpoint). Non-coordinating ranks request
/// [`ArrayFill::Empty`] and must get arrays matching the coordinating rank's
/// names and kinds; divergence is caught collectively during partitioning.
///
/// Any `Fn(ArrayFill) -> Result<Vec<ParticleArray>, FactoryFailure>` is a
/// factory.
pub trait ParticleFactory {
    /// Create the arrays.
    ///
    /// # Errors
    ///
    /// Returns whatever the user construction code fails with.
    fn create(&self, fill: ArrayFill) -> Result<Vec<ParticleArray>, FactoryFailure>;
}

impl<F> ParticleFactory for F
where
    F: Fn(ArrayFill) -> Result<Vec<ParticleArray>, FactoryFailure>,
{
    fn create(&self, fill: ArrayFill) -> Result<Vec<ParticleArray>, FactoryFailure> {
        self(fill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(fill: ArrayFill) -> Result<Vec<ParticleArray>, FactoryFailure> {
        let fluid = ParticleArray::new("fluid").with_field("x", vec![0.0, 1.0])?;
        Ok(match fill {
            ArrayFill::Populated => vec![fluid],
            ArrayFill::Empty => vec![fluid.empty_like()],
        })
    }

    #[test]
    fn test_closure_is_a_factory() {
        let full = make.create(ArrayFill::Populated).unwrap();
        let empty = make.create(ArrayFill::Empty).unwrap();
        assert_eq!(full[0].len(), 2);
        assert!(empty[0].is_empty());
        assert_eq!(full[0].name(), empty[0].name());
    }

    #[test]
    fn test_factory_errors_propagate() {
        let failing = |_: ArrayFill| -> Result<Vec<ParticleArray>, FactoryFailure> {
            Err("no geometry".into())
        };
        let err = failing.create(ArrayFill::Populated).unwrap_err();
        assert_eq!(err.to_string(), "no geometry");
    }
}
