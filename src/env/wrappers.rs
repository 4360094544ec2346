//! Action space translation
//!
//! Lets policy code that only knows a flat discrete space drive an
//! environment whose actions are a dictionary of independent discrete
//! choices.

use async_trait::async_trait;
use std::collections::BTreeMap;

use super::spaces::{Action, ActionSpace, ImageShape, Observation, StepResult};
use super::traits::{EnvError, EnvResult, Environment};

/// Reduce a space to the kinds that can be represented on the wire.
///
/// Dict members that cannot be translated are dropped, and a Dict left
/// empty translates to `None`.
pub fn translate_action_space(space: &ActionSpace) -> Option<ActionSpace> {
    match space {
        ActionSpace::Dict(spaces) => {
            let translated: BTreeMap<_, _> = spaces
                .iter()
                .filter_map(|(name, sub)| translate_action_space(sub).map(|s| (name.clone(), s)))
                .collect();
            if translated.is_empty() {
                tracing::warn!("Action space has no translatable members");
                return None;
            }
            Some(ActionSpace::Dict(translated))
        }
        ActionSpace::Discrete(n) => Some(ActionSpace::Discrete(*n)),
        ActionSpace::MultiDiscrete(dims) if !dims.is_empty() => {
            Some(ActionSpace::MultiDiscrete(dims.clone()))
        }
        ActionSpace::Continuous { low, high, shape } => Some(ActionSpace::Continuous {
            low: *low,
            high: *high,
            shape: shape.clone(),
        }),
        ActionSpace::MultiDiscrete(_) => None,
    }
}

/// The discrete members of a dict space, in key order
fn discrete_members(space: &ActionSpace) -> Vec<(String, u32)> {
    match space {
        ActionSpace::Dict(spaces) => spaces
            .iter()
            .filter_map(|(name, sub)| match sub {
                ActionSpace::Discrete(n) => Some((name.clone(), *n)),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Flattens a dict of discrete choices into one discrete space.
///
/// Flat index `i` selects one (name, value) pair; only that member is set
/// in the forwarded action.
pub struct DictToDiscrete<E> {
    inner: E,
    choices: Vec<(String, u32)>,
}

impl<E: Environment> DictToDiscrete<E> {
    pub fn new(inner: E) -> Self {
        let choices = discrete_members(&inner.action_space())
            .into_iter()
            .flat_map(|(name, n)| (0..n).map(move |value| (name.clone(), value)))
            .collect::<Vec<_>>();
        tracing::debug!("Flattened dict action space into {} choices", choices.len());
        Self { inner, choices }
    }

    /// Translate a flat index into the inner dict action
    pub fn translate(&self, action: &Action) -> EnvResult<Action> {
        let index = match action {
            Action::Discrete(i) => *i as usize,
            other => {
                return Err(EnvError::InvalidAction(format!(
                    "expected a discrete action, got {:?}",
                    other
                )))
            }
        };

        let (name, value) = self.choices.get(index).ok_or_else(|| {
            EnvError::InvalidAction(format!(
                "index {} out of range for {} choices",
                index,
                self.choices.len()
            ))
        })?;

        let mut dict = BTreeMap::new();
        dict.insert(name.clone(), *value);
        Ok(Action::Dict(dict))
    }

    pub fn into_inner(self) -> E {
        self.inner
    }
}

#[async_trait]
impl<E: Environment> Environment for DictToDiscrete<E> {
    async fn reset(&mut self) -> EnvResult<Observation> {
        self.inner.reset().await
    }

    async fn step(&mut self, action: &Action) -> EnvResult<StepResult> {
        let translated = self.translate(action)?;
        self.inner.step(&translated).await
    }

    async fn close(&mut self) -> EnvResult<()> {
        self.inner.close().await
    }

    fn action_space(&self) -> ActionSpace {
        ActionSpace::Discrete(self.choices.len() as u32)
    }

    fn observation_shape(&self) -> ImageShape {
        self.inner.observation_shape()
    }
}

/// Presents a dict of discrete choices as a multi-discrete space
pub struct DictToMultiDiscrete<E> {
    inner: E,
    members: Vec<(String, u32)>,
}

impl<E: Environment> DictToMultiDiscrete<E> {
    pub fn new(inner: E) -> Self {
        let members = discrete_members(&inner.action_space());
        Self { inner, members }
    }

    pub fn translate(&self, action: &Action) -> EnvResult<Action> {
        let values = match action {
            Action::MultiDiscrete(values) if values.len() == self.members.len() => values,
            other => {
                return Err(EnvError::InvalidAction(format!(
                    "expected {} multi-discrete values, got {:?}",
                    self.members.len(),
                    other
                )))
            }
        };

        Ok(Action::Dict(
            self.members
                .iter()
                .zip(values)
                .map(|((name, _), value)| (name.clone(), *value))
                .collect(),
        ))
    }
}

#[async_trait]
impl<E: Environment> Environment for DictToMultiDiscrete<E> {
    async fn reset(&mut self) -> EnvResult<Observation> {
        self.inner.reset().await
    }

    async fn step(&mut self, action: &Action) -> EnvResult<StepResult> {
        let translated = self.translate(action)?;
        self.inner.step(&translated).await
    }

    async fn close(&mut self) -> EnvResult<()> {
        self.inner.close().await
    }

    fn action_space(&self) -> ActionSpace {
        ActionSpace::MultiDiscrete(self.members.iter().map(|(_, n)| *n).collect())
    }

    fn observation_shape(&self) -> ImageShape {
        self.inner.observation_shape()
    }
}
