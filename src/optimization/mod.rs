mod accumulator;
mod adam;
mod gradient_descent;
mod gradient_descent_with_momentum;
mod params_optimizer;
mod update_method;
mod update_rule;

pub use accumulator::{GradientAccumulator, Reduction};
pub use adam::Adam;
pub use gradient_descent::GradientDescent;
pub use gradient_descent_with_momentum::GradientDescentWithMomentum;
pub use params_optimizer::{BlockOptimizer, RowsOptimizer};
pub use update_method::UpdateMethod;
pub use update_rule::UpdateRule;
