//! Action and observation types
//!
//! Observations are opaque bytes plus the image shape they should be read
//! with. Actions are either indices into an action space or raw commands.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Height x width x channel depth of an image-like observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageShape {
    pub height: u32,
    pub width: u32,
    /// 3 for RGB, 4 when scene depth is included
    pub depth: u32,
}

impl ImageShape {
    pub fn new(height: u32, width: u32, depth: u32) -> Self {
        Self {
            height,
            width,
            depth,
        }
    }

    /// Number of bytes in one observation of this shape
    pub fn len(&self) -> usize {
        self.height as usize * self.width as usize * self.depth as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ImageShape {
    fn default() -> Self {
        Self::new(84, 84, 3)
    }
}

/// One observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub data: Vec<u8>,
    pub shape: ImageShape,
}

impl Observation {
    /// Wrap raw bytes. An empty payload becomes a zero-filled frame.
    pub fn from_bytes(data: Vec<u8>, shape: ImageShape) -> Self {
        if data.is_empty() {
            return Self::zeros(shape);
        }
        Self { data, shape }
    }

    pub fn zeros(shape: ImageShape) -> Self {
        Self {
            data: vec![0; shape.len()],
            shape,
        }
    }

    /// Whether the byte count matches the declared shape
    pub fn is_well_formed(&self) -> bool {
        self.data.len() == self.shape.len()
    }

    /// Channel `c` of the pixel at row `y`, column `x` (row-major HWC)
    pub fn pixel(&self, y: u32, x: u32, c: u32) -> Option<u8> {
        if y >= self.shape.height || x >= self.shape.width || c >= self.shape.depth {
            return None;
        }
        let index = ((y as usize * self.shape.width as usize) + x as usize)
            * self.shape.depth as usize
            + c as usize;
        self.data.get(index).copied()
    }
}

/// Result of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub observation: Observation,
    /// Reward for this step as reported by the simulation
    pub reward: f64,
    pub done: bool,
    pub info: Option<String>,
}

/// An action to perform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    Discrete(u32),
    MultiDiscrete(Vec<u32>),
    Continuous(Vec<f32>),
    Dict(BTreeMap<String, u32>),
    /// A raw simulation command, passed through untouched
    Command(String),
}

/// The set of valid actions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionSpace {
    Discrete(u32),
    MultiDiscrete(Vec<u32>),
    Continuous {
        low: f32,
        high: f32,
        shape: Vec<u32>,
    },
    Dict(BTreeMap<String, ActionSpace>),
}

impl ActionSpace {
    /// Whether `action` is a member of this space
    pub fn contains(&self, action: &Action) -> bool {
        match (self, action) {
            (ActionSpace::Discrete(n), Action::Discrete(i)) => i < n,
            (ActionSpace::MultiDiscrete(dims), Action::MultiDiscrete(values)) => {
                dims.len() == values.len() && values.iter().zip(dims).all(|(v, d)| v < d)
            }
            (ActionSpace::Continuous { low, high, shape }, Action::Continuous(values)) => {
                values.len() == shape.iter().product::<u32>() as usize
                    && values.iter().all(|v| v >= low && v <= high)
            }
            (ActionSpace::Dict(spaces), Action::Dict(values)) => {
                values.iter().all(|(name, value)| match spaces.get(name) {
                    Some(ActionSpace::Discrete(n)) => value < n,
                    _ => false,
                })
            }
            _ => false,
        }
    }

    /// Whether the space has no members, e.g. `Discrete(0)`
    pub fn is_empty(&self) -> bool {
        match self {
            ActionSpace::Discrete(n) => *n == 0,
            ActionSpace::MultiDiscrete(dims) => dims.contains(&0),
            ActionSpace::Continuous { low, high, .. } => low.is_nan() || high.is_nan() || low > high,
            ActionSpace::Dict(spaces) => spaces
                .values()
                .any(|space| matches!(space, ActionSpace::Discrete(0))),
        }
    }

    /// Draw a uniformly random action, `None` for an empty space
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Action> {
        if self.is_empty() {
            return None;
        }
        let action = match self {
            ActionSpace::Discrete(n) => Action::Discrete(rng.gen_range(0..*n)),
            ActionSpace::MultiDiscrete(dims) => {
                Action::MultiDiscrete(dims.iter().map(|d| rng.gen_range(0..*d)).collect())
            }
            ActionSpace::Continuous { low, high, shape } => {
                let count = shape.iter().product::<u32>() as usize;
                Action::Continuous(
                    (0..count)
                        .map(|_| if low < high { rng.gen_range(*low..*high) } else { *low })
                        .collect(),
                )
            }
            ActionSpace::Dict(spaces) => Action::Dict(
                spaces
                    .iter()
                    .filter_map(|(name, space)| match space {
                        ActionSpace::Discrete(n) => Some((name.clone(), rng.gen_range(0..*n))),
                        _ => None,
                    })
                    .collect(),
            ),
        };
        Some(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_empty_observation_is_zero_filled() {
        let shape = ImageShape::new(2, 3, 4);
        let obs = Observation::from_bytes(Vec::new(), shape);
        assert_eq!(obs.data.len(), 24);
        assert!(obs.is_well_formed());
        assert!(obs.data.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_pixel_indexing_is_row_major() {
        let shape = ImageShape::new(2, 2, 3);
        let obs = Observation::from_bytes((0..12).collect(), shape);

        assert_eq!(obs.pixel(0, 0, 0), Some(0));
        assert_eq!(obs.pixel(0, 1, 2), Some(5));
        assert_eq!(obs.pixel(1, 0, 1), Some(7));
        assert_eq!(obs.pixel(2, 0, 0), None);
    }

    #[test]
    fn test_samples_are_members() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut dict = BTreeMap::new();
        dict.insert("attack".to_string(), ActionSpace::Discrete(2));
        dict.insert(
            "camera".to_string(),
            ActionSpace::Continuous {
                low: -180.0,
                high: 180.0,
                shape: vec![2],
            },
        );

        let spaces = vec![
            ActionSpace::Discrete(4),
            ActionSpace::MultiDiscrete(vec![2, 3]),
            ActionSpace::Continuous {
                low: -1.0,
                high: 1.0,
                shape: vec![2, 2],
            },
            ActionSpace::Dict(dict),
        ];

        for space in spaces {
            for _ in 0..20 {
                let action = space.sample(&mut rng).unwrap();
                assert!(space.contains(&action), "{:?} not in {:?}", action, space);
            }
        }
    }

    #[test]
    fn test_empty_spaces_have_no_sample() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut dict = BTreeMap::new();
        dict.insert("attack".to_string(), ActionSpace::Discrete(0));

        for space in [
            ActionSpace::Discrete(0),
            ActionSpace::MultiDiscrete(vec![2, 0]),
            ActionSpace::Dict(dict),
        ] {
            assert!(space.is_empty());
            assert_eq!(space.sample(&mut rng), None);
        }
        assert!(!ActionSpace::Discrete(0).contains(&Action::Discrete(0)));
        assert!(!ActionSpace::Discrete(1).is_empty());
    }

    #[test]
    fn test_contains_rejects_mismatched_kind() {
        assert!(!ActionSpace::Discrete(3).contains(&Action::Discrete(3)));
        assert!(!ActionSpace::Discrete(3).contains(&Action::MultiDiscrete(vec![0])));
    }
}
