// End-to-end tests against the simulated device


#[cfg(test)]
mod verifier_tests;

#[cfg(test)]
mod service_tests;
