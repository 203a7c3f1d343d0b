//! Exponential moving average of a model's parameters.
//!
//! The shadow is swapped into the model for the duration of an [`EmaScope`] and the live
//! parameters are put back when the scope ends, on every exit path.

use crate::model::TrainableDrift;
use crate::{Error, Result};
use ndarray::{Array1, ArrayView1};
use std::ops::Deref;

#[derive(Debug, Clone)]
pub struct Ema {
    decay: f32,
    shadow: Array1<f32>,
    backup: Option<Array1<f32>>,
}

impl Ema {
    /// Start the average at the model's current parameters.
    pub fn new<M: TrainableDrift + ?Sized>(model: &M, decay: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&decay) {
            return Err(Error::Domain("ema decay must be in [0, 1)"));
        }
        Ok(Self {
            decay,
            shadow: model.params().to_owned(),
            backup: None,
        })
    }

    pub fn decay(&self) -> f32 {
        self.decay
    }

    pub fn shadow(&self) -> ArrayView1<'_, f32> {
        self.shadow.view()
    }

    pub fn is_applied(&self) -> bool {
        self.backup.is_some()
    }

    /// `shadow ← decay·shadow + (1 − decay)·params`.
    pub fn update<M: TrainableDrift + ?Sized>(&mut self, model: &M) -> Result<()> {
        if self.is_applied() {
            return Err(Error::Domain("cannot update an ema while its shadow is applied"));
        }
        let params = model.params();
        if params.len() != self.shadow.len() {
            return Err(Error::Shape("model parameter count changed"));
        }
        let d = self.decay;
        self.shadow.zip_mut_with(&params, |s, &p| *s = d * *s + (1.0 - d) * p);
        Ok(())
    }

    /// Swap the shadow into `model`, keeping the live parameters aside.
    pub fn apply<M: TrainableDrift + ?Sized>(&mut self, model: &mut M) -> Result<()> {
        if self.is_applied() {
            return Err(Error::Domain("ema shadow is already applied"));
        }
        if model.params().len() != self.shadow.len() {
            return Err(Error::Shape("model parameter count changed"));
        }
        self.backup = Some(model.params().to_owned());
        model.params_mut().assign(&self.shadow);
        Ok(())
    }

    /// Put the live parameters back. No-op when the shadow is not applied.
    pub fn restore<M: TrainableDrift + ?Sized>(&mut self, model: &mut M) {
        if let Some(live) = self.backup.take() {
            model.params_mut().assign(&live);
        }
    }

    /// Apply the shadow for as long as the returned guard lives.
    pub fn scope<'a, M: TrainableDrift + ?Sized>(
        &'a mut self,
        model: &'a mut M,
    ) -> Result<EmaScope<'a, M>> {
        self.apply(&mut *model)?;
        Ok(EmaScope { ema: self, model })
    }
}

/// Read-only view of a model with its EMA shadow applied.
pub struct EmaScope<'a, M: TrainableDrift + ?Sized> {
    ema: &'a mut Ema,
    model: &'a mut M,
}

impl<M: TrainableDrift + ?Sized> Deref for EmaScope<'_, M> {
    type Target = M;

    fn deref(&self) -> &M {
        &*self.model
    }
}

impl<M: TrainableDrift + ?Sized> Drop for EmaScope<'_, M> {
    fn drop(&mut self) {
        self.ema.restore(&mut *self.model);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linear::LinearDrift;

    fn model_with(v: f32) -> LinearDrift {
        let mut m = LinearDrift::new_zeros(1);
        m.params_mut().fill(v);
        m
    }

    #[test]
    fn update_tracks_the_parameters() {
        let mut m = model_with(0.0);
        let mut ema = Ema::new(&m, 0.5).unwrap();
        m.params_mut().fill(4.0);
        ema.update(&m).unwrap();
        assert!(ema.shadow().iter().all(|&s| s == 2.0));
        ema.update(&m).unwrap();
        assert!(ema.shadow().iter().all(|&s| s == 3.0));
    }

    #[test]
    fn apply_and_restore_swap_parameters() {
        let mut m = model_with(0.0);
        let mut ema = Ema::new(&m, 0.9).unwrap();
        m.params_mut().fill(1.0);

        ema.apply(&mut m).unwrap();
        assert!(m.params().iter().all(|&p| p == 0.0));
        assert!(matches!(ema.apply(&mut m), Err(Error::Domain(_))));
        assert!(ema.update(&m).is_err());

        ema.restore(&mut m);
        assert!(m.params().iter().all(|&p| p == 1.0));
        ema.restore(&mut m);
        assert!(m.params().iter().all(|&p| p == 1.0));
    }

    #[test]
    fn scope_restores_on_early_return() {
        fn fails_inside(ema: &mut Ema, m: &mut LinearDrift) -> Result<()> {
            let scoped = ema.scope(m)?;
            assert!(scoped.params().iter().all(|&p| p == 0.0));
            Err(Error::Numerical {
                step: 3,
                quantity: "drift",
            })
        }

        let mut m = model_with(0.0);
        let mut ema = Ema::new(&m, 0.9).unwrap();
        m.params_mut().fill(7.0);
        assert!(fails_inside(&mut ema, &mut m).is_err());
        assert!(!ema.is_applied());
        assert!(m.params().iter().all(|&p| p == 7.0));
    }

    #[test]
    fn rejects_bad_decay() {
        let m = model_with(0.0);
        assert!(Ema::new(&m, 1.0).is_err());
        assert!(Ema::new(&m, -0.1).is_err());
    }
}
