//! The FedNova normalization coefficient `a_i` of a client.
//!
//! `a_i` is the accumulated effective step size of the local optimizer trajectory, in units of
//! the learning rate: under a constant gradient `g` the client update after `tau` steps is exactly
//! `lr * a_i * g`. Dividing the update by `a_i` thus removes the bias of heterogeneous amounts of
//! local work.

/// Computes `a_i` for `local_steps` steps of SGD with the given learning rate, local momentum and
/// proximal coefficient.
///
/// - plain SGD: `a = tau`
/// - momentum `rho`: `a = (tau - rho * (1 - rho^tau) / (1 - rho)) / (1 - rho)`
/// - proximal term `mu` (with `eta = lr`): `a = (1 - (1 - eta * mu)^tau) / (eta * mu)`
///
/// With both momentum and a proximal term, the coefficient is evaluated from the recursion of the
/// optimizer under a unit constant gradient, which agrees with both closed forms in their
/// respective limits.
pub fn normalization_coeff(local_steps: u64, lr: f64, momentum: f64, prox_mu: f64) -> f64 {
    let tau = local_steps as f64;
    let eta_mu = lr * prox_mu;

    match (momentum > 0.0, eta_mu > 0.0) {
        (false, false) => tau,
        (true, false) => {
            let rho = momentum;
            (tau - rho * (1.0 - rho.powf(tau)) / (1.0 - rho)) / (1.0 - rho)
        }
        (false, true) => (1.0 - (1.0 - eta_mu).powf(tau)) / eta_mu,
        (true, true) => {
            let (mut buf, mut distance) = (0.0_f64, 0.0_f64);
            for _ in 0..local_steps {
                buf = momentum * buf + (1.0 - prox_mu * distance);
                distance += lr * buf;
            }
            distance / lr
        }
    }
}
