//! Platform device integrations.
//!
//! The pipeline's device needs (geolocation, cameras, recorder, outbound
//! alert transport) are trait seams defined next to their consumers
//! ([`crate::location::PositionSource`], [`crate::capture::CaptureProvider`],
//! [`crate::alert::AlertTransport`]). This module provides the two concrete
//! families:
//!
//! - [`gateway`]: HTTP clients against a device gateway and alert webhook,
//!   for deployments where the platform exposes devices over the network.
//! - [`sim`]: in-process simulated devices, used when no gateway is
//!   configured and throughout the test suites.

pub mod gateway;
pub mod sim;
