//! Implementation of `versa version`.

pub fn run() {
    println!("versa {}", env!("CARGO_PKG_VERSION"));
}
