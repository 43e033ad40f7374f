//! Lifeline - Emergency activation and evidence capture pipeline.
//!
//! # Overview
//!
//! Lifeline is the core of a personal-safety companion: the subsystem that runs
//! when a traveler presses a panic/SOS control. Within a bounded time budget it
//!
//! - drives the activation state machine (armed → active → resolved/cancelled),
//! - continuously samples and broadcasts device location,
//! - captures periodic stills from the front and rear cameras plus one continuous
//!   audio/video recording,
//! - persists everything against a durable record store with an explicit
//!   in-memory fallback that tags its data as unconfirmed rather than losing it,
//! - fans alerts out to a bounded contact list and arms a delayed call to the
//!   public emergency number.
//!
//! # Availability Guarantees
//!
//! The pipeline is designed so that **no storage or device failure blocks the
//! user from their own session**:
//!
//! - Durable-backend outages are absorbed by a bounded in-memory fallback; the
//!   resulting records carry `served_by_fallback = true` so the UI can show
//!   "not yet confirmed saved" instead of claiming false durability.
//! - Camera, recorder and geolocation failures degrade the evidence stream but
//!   never abort the session.
//! - A single failed contact delivery never fails the others.
//!
//! # Modules
//!
//! - [`model`]: Records, samples, media assets, contacts, and API types
//! - [`error`]: Error taxonomy for the activation lifecycle
//! - [`store`]: Durable SQLite store with bounded in-memory fallback
//! - [`location`]: Periodic location sampling
//! - [`capture`]: Periodic still capture and continuous A/V recording
//! - [`alert`]: Contact fan-out and the delayed emergency call
//! - [`controller`]: The activation state machine and subsystem lifecycle
//! - [`device`]: Device gateway client and simulated devices
//! - [`api`]: HTTP API handlers

pub mod alert;
pub mod api;
pub mod capture;
pub mod controller;
pub mod device;
pub mod error;
pub mod location;
pub mod model;
pub mod store;
