use rand::{distributions::Alphanumeric, thread_rng, Rng};

mod id;
pub use id::*;

/// Returns a random uppercase alphanumeric string of the given length.
pub fn random_uppercase_string(length: usize) -> String {
    let mut rng = thread_rng();

    std::iter::repeat(())
        .map(|_| rng.sample(Alphanumeric) as char)
        .map(|c| c.to_ascii_uppercase())
        .take(length)
        .collect()
}
