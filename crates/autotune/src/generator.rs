//! Q-learning discrete parameter generators.
//!
//! A generator walks a finite [`SearchSpace`] by local moves. Each visited
//! point keeps a table of outgoing transitions (direction, target, value);
//! measured costs are written back onto the transition that produced a
//! choice, and the `Q` policy follows the best-valued transition.

use crate::error::SearchError;
use crate::factors::{divisors, factorizations};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::{trace, warn};

/// Dense integer coordinates of a choice.
pub type Point = Vec<i64>;
/// Local move applied to a [`Point`].
pub type Direction = Vec<i32>;

pub const DEFAULT_EXPLORE: f64 = 0.01;

/// A proposed value together with the move that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Choice<V> {
    pub value: V,
    pub direction: Direction,
}

impl<V> Choice<V> {
    pub fn new(value: V, direction: Direction) -> Self {
        Self { value, direction }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    #[default]
    Random,
    Q,
    Greedy,
}

impl FromStr for Policy {
    type Err = SearchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random" => Ok(Policy::Random),
            "q" => Ok(Policy::Q),
            "greedy" => Ok(Policy::Greedy),
            other => Err(SearchError::UnknownPolicy(other.to_string())),
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Policy::Random => "random",
            Policy::Q => "q",
            Policy::Greedy => "greedy",
        })
    }
}

/// A finite choice space with a local-move structure.
pub trait SearchSpace {
    type Value: Clone + fmt::Debug;

    /// Every valid point, one per representable choice.
    fn points(&self) -> &[Point];

    fn directions(&self) -> &[Direction];

    /// The zero move.
    fn stay(&self) -> Direction;

    /// Point reached from `from` along `direction`, if it is valid.
    fn step(&self, from: &Point, direction: &Direction) -> Option<Point>;

    /// Inverse of [`SearchSpace::step`]: the point that reaches `to` along
    /// `direction`.
    fn retreat(&self, to: &Point, direction: &Direction) -> Option<Point>;

    fn valid(&self, point: &Point) -> bool;

    fn map_to_hidden(&self, value: &Self::Value) -> Option<Point>;

    fn map_from_hidden(&self, point: &Point) -> Option<Self::Value>;
}

/// Ordered factorizations of an extent into a fixed number of parts.
///
/// Each factor is represented by its rank among the sorted divisors of the
/// extent. A move shifts the ranks of all but the last factor; the last factor
/// completes the product.
#[derive(Debug, Clone)]
pub struct FactorSpace {
    extent: usize,
    parts: usize,
    divisors: Vec<usize>,
    choices: Vec<Vec<usize>>,
    points: Vec<Point>,
    directions: Vec<Direction>,
}

impl FactorSpace {
    pub fn new(extent: usize, parts: usize) -> Result<Self, SearchError> {
        let choices = factorizations(extent, parts);
        if choices.is_empty() {
            return Err(SearchError::EmptyFactorSpace { extent, parts });
        }
        let divisors = divisors(extent);
        let points = choices
            .iter()
            .map(|factors| {
                factors
                    .iter()
                    .map(|factor| divisors.binary_search(factor).map_or(-1, |rank| rank as i64))
                    .collect()
            })
            .collect();
        Ok(Self {
            extent,
            parts,
            divisors,
            choices,
            points,
            directions: unit_directions(parts - 1),
        })
    }

    pub fn extent(&self) -> usize {
        self.extent
    }

    pub fn parts(&self) -> usize {
        self.parts
    }

    /// Largest divisor rank.
    pub fn sum_val(&self) -> usize {
        self.divisors.len() - 1
    }

    pub fn choices(&self) -> &[Vec<usize>] {
        &self.choices
    }

    fn factor(&self, rank: i64) -> Option<usize> {
        usize::try_from(rank)
            .ok()
            .and_then(|rank| self.divisors.get(rank).copied())
    }

    fn rank(&self, factor: usize) -> Option<i64> {
        self.divisors
            .binary_search(&factor)
            .ok()
            .map(|rank| rank as i64)
    }

    fn shift(&self, point: &Point, direction: &Direction, sign: i64) -> Option<Point> {
        if point.len() != self.parts || direction.len() + 1 != self.parts {
            return None;
        }
        let mut shifted = Vec::with_capacity(self.parts);
        let mut prefix = 1usize;
        for (rank, delta) in point.iter().zip(direction) {
            let moved = rank + sign * i64::from(*delta);
            prefix = prefix.checked_mul(self.factor(moved)?)?;
            shifted.push(moved);
        }
        if self.extent % prefix != 0 {
            return None;
        }
        shifted.push(self.rank(self.extent / prefix)?);
        Some(shifted)
    }
}

impl SearchSpace for FactorSpace {
    type Value = Vec<usize>;

    fn points(&self) -> &[Point] {
        &self.points
    }

    fn directions(&self) -> &[Direction] {
        &self.directions
    }

    fn stay(&self) -> Direction {
        vec![0; self.parts - 1]
    }

    fn step(&self, from: &Point, direction: &Direction) -> Option<Point> {
        self.shift(from, direction, 1)
    }

    fn retreat(&self, to: &Point, direction: &Direction) -> Option<Point> {
        self.shift(to, direction, -1)
    }

    fn valid(&self, point: &Point) -> bool {
        self.map_from_hidden(point).is_some()
    }

    fn map_to_hidden(&self, value: &Vec<usize>) -> Option<Point> {
        if value.len() != self.parts || value.iter().product::<usize>() != self.extent {
            return None;
        }
        value.iter().map(|factor| self.rank(*factor)).collect()
    }

    fn map_from_hidden(&self, point: &Point) -> Option<Vec<usize>> {
        if point.len() != self.parts {
            return None;
        }
        let factors: Vec<usize> = point
            .iter()
            .map(|rank| self.factor(*rank))
            .collect::<Option<_>>()?;
        let product = factors
            .iter()
            .try_fold(1usize, |acc, factor| acc.checked_mul(*factor))?;
        (product == self.extent).then_some(factors)
    }
}

/// A short ordered menu of values walked one entry at a time.
#[derive(Debug, Clone)]
pub struct MenuSpace {
    values: Vec<usize>,
    points: Vec<Point>,
    directions: Vec<Direction>,
}

impl MenuSpace {
    pub fn new(values: Vec<usize>) -> Result<Self, SearchError> {
        if values.is_empty() {
            return Err(SearchError::EmptyMenu);
        }
        let points = (0..values.len() as i64).map(|index| vec![index]).collect();
        Ok(Self {
            values,
            points,
            directions: vec![vec![0], vec![1], vec![-1]],
        })
    }

    pub fn values(&self) -> &[usize] {
        &self.values
    }

    fn value_at(&self, index: i64) -> Option<usize> {
        usize::try_from(index)
            .ok()
            .and_then(|index| self.values.get(index).copied())
    }

    fn shift(&self, point: &Point, direction: &Direction, sign: i64) -> Option<Point> {
        match (point.as_slice(), direction.as_slice()) {
            ([index], [delta]) => {
                let moved = index + sign * i64::from(*delta);
                self.value_at(moved).map(|_| vec![moved])
            }
            _ => None,
        }
    }
}

impl SearchSpace for MenuSpace {
    type Value = usize;

    fn points(&self) -> &[Point] {
        &self.points
    }

    fn directions(&self) -> &[Direction] {
        &self.directions
    }

    fn stay(&self) -> Direction {
        vec![0]
    }

    fn step(&self, from: &Point, direction: &Direction) -> Option<Point> {
        self.shift(from, direction, 1)
    }

    fn retreat(&self, to: &Point, direction: &Direction) -> Option<Point> {
        self.shift(to, direction, -1)
    }

    fn valid(&self, point: &Point) -> bool {
        matches!(point.as_slice(), [index] if self.value_at(*index).is_some())
    }

    fn map_to_hidden(&self, value: &usize) -> Option<Point> {
        self.values
            .iter()
            .position(|candidate| candidate == value)
            .map(|index| vec![index as i64])
    }

    fn map_from_hidden(&self, point: &Point) -> Option<usize> {
        match point.as_slice() {
            [index] => self.value_at(*index),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Transition {
    direction: Direction,
    target: Point,
    value: f64,
}

/// Local-search generator over one tunable dimension.
#[derive(Debug, Clone)]
pub struct QLearningGenerator<S: SearchSpace> {
    space: S,
    table: HashMap<Point, Vec<Transition>>,
    rng: fastrand::Rng,
    explore: f64,
    best: Option<(f64, Choice<S::Value>)>,
}

pub type SplitFactorGenerator = QLearningGenerator<FactorSpace>;
pub type VectorizeLengthGenerator = QLearningGenerator<MenuSpace>;
pub type UnrollStepGenerator = QLearningGenerator<MenuSpace>;

impl<S: SearchSpace> QLearningGenerator<S> {
    pub fn new(space: S, seed: u64) -> Self {
        Self {
            space,
            table: HashMap::new(),
            rng: fastrand::Rng::with_seed(seed),
            explore: DEFAULT_EXPLORE,
            best: None,
        }
    }

    pub fn with_exploration(mut self, explore: f64) -> Self {
        self.explore = explore.clamp(0.0, 1.0);
        self
    }

    pub fn space(&self) -> &S {
        &self.space
    }

    /// Best choice recorded through feedback so far.
    pub fn best(&self) -> Option<&Choice<S::Value>> {
        self.best.as_ref().map(|(_, choice)| choice)
    }

    pub fn valid(&self, candidate: &S::Value) -> bool {
        self.space
            .map_to_hidden(candidate)
            .is_some_and(|point| self.space.valid(&point))
    }

    /// Propose a choice.
    ///
    /// `None` means the exploration move left the space; callers retry.
    pub fn get(&mut self, policy: Policy, hint: Option<&S::Value>) -> Option<Choice<S::Value>> {
        match policy {
            Policy::Random => self.random_choice(),
            Policy::Greedy => match &self.best {
                Some((_, choice)) => Some(choice.clone()),
                None => self.random_choice(),
            },
            Policy::Q => {
                let start = match hint
                    .and_then(|value| self.space.map_to_hidden(value))
                    .filter(|point| self.space.valid(point))
                {
                    Some(point) => point,
                    None => self.random_point()?,
                };

                if self.rng.f64() < self.explore {
                    let directions = self.space.directions();
                    if directions.is_empty() {
                        return None;
                    }
                    let direction = directions.get(self.rng.usize(..directions.len()))?.clone();
                    let target = self.space.step(&start, &direction)?;
                    return self.choice_at(&target, direction);
                }

                let transitions = Self::transitions(&self.space, &mut self.table, &start);
                let best_value = transitions
                    .iter()
                    .map(|transition| transition.value)
                    .fold(f64::NEG_INFINITY, f64::max);
                let ties: Vec<&Transition> = transitions
                    .iter()
                    .filter(|transition| transition.value == best_value)
                    .collect();
                if ties.is_empty() {
                    return self.random_choice();
                }
                let picked = ties[self.rng.usize(..ties.len())];
                let (target, direction) = (picked.target.clone(), picked.direction.clone());
                self.choice_at(&target, direction)
            }
        }
    }

    /// Record `cost` (higher is better) for the move that produced `choice`.
    pub fn feedback(&mut self, choice: &Choice<S::Value>, cost: f64) {
        let Some(target) = self.space.map_to_hidden(&choice.value) else {
            warn!(value = ?choice.value, "feedback for a value outside the search space ignored");
            return;
        };
        let Some(origin) = self.space.retreat(&target, &choice.direction) else {
            warn!(
                value = ?choice.value,
                direction = ?choice.direction,
                "feedback with an unrepresentable direction ignored"
            );
            return;
        };

        let transitions = Self::transitions(&self.space, &mut self.table, &origin);
        match transitions
            .iter_mut()
            .find(|transition| transition.direction == choice.direction)
        {
            Some(transition) => transition.value = cost,
            None => transitions.push(Transition {
                direction: choice.direction.clone(),
                target,
                value: cost,
            }),
        }
        trace!(origin = ?origin, direction = ?choice.direction, cost, "updated transition value");

        if self.best.as_ref().map_or(true, |(best, _)| cost > *best) {
            self.best = Some((cost, choice.clone()));
        }
    }

    fn transitions<'a>(
        space: &S,
        table: &'a mut HashMap<Point, Vec<Transition>>,
        point: &Point,
    ) -> &'a mut Vec<Transition> {
        table.entry(point.clone()).or_insert_with(|| {
            space
                .directions()
                .iter()
                .filter_map(|direction| {
                    space.step(point, direction).map(|target| Transition {
                        direction: direction.clone(),
                        target,
                        value: 0.0,
                    })
                })
                .collect()
        })
    }

    fn random_point(&mut self) -> Option<Point> {
        let points = self.space.points();
        if points.is_empty() {
            return None;
        }
        Some(points[self.rng.usize(..points.len())].clone())
    }

    fn random_choice(&mut self) -> Option<Choice<S::Value>> {
        let point = self.random_point()?;
        let stay = self.space.stay();
        self.choice_at(&point, stay)
    }

    fn choice_at(&self, point: &Point, direction: Direction) -> Option<Choice<S::Value>> {
        self.space
            .map_from_hidden(point)
            .map(|value| Choice::new(value, direction))
    }
}

impl QLearningGenerator<FactorSpace> {
    /// Generator over the `parts`-way factorizations of `extent`.
    pub fn split(extent: usize, parts: usize, seed: u64) -> Result<Self, SearchError> {
        Ok(Self::new(FactorSpace::new(extent, parts)?, seed))
    }
}

impl QLearningGenerator<MenuSpace> {
    /// Generator over the divisors of the widest vector access.
    pub fn vector_lengths(max_length: usize, seed: u64) -> Result<Self, SearchError> {
        Ok(Self::new(MenuSpace::new(divisors(max_length))?, seed))
    }

    pub fn menu(values: &[usize], seed: u64) -> Result<Self, SearchError> {
        Ok(Self::new(MenuSpace::new(values.to_vec())?, seed))
    }
}

/// Every vector in {-1, 0, 1}^dim.
fn unit_directions(dim: usize) -> Vec<Direction> {
    let mut directions: Vec<Direction> = vec![Vec::with_capacity(dim)];
    for _ in 0..dim {
        directions = directions
            .into_iter()
            .flat_map(|prefix| {
                [-1, 0, 1].into_iter().map(move |delta| {
                    let mut next = prefix.clone();
                    next.push(delta);
                    next
                })
            })
            .collect();
    }
    directions
}
