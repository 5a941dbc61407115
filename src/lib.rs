// #![warn(missing_docs)]

//! Persistent, always up-to-date access to EPICS PVs.
//!
//! Rather than asking for a value each time it is needed, this crate keeps a monitor
//! open on each PV of interest and caches whatever it last delivered. Reading the
//! cache never touches the network, and code that needs to wait for a change can
//! block until the next update arrives.
//!
//! <div class="warning">This is a very early version of this library. Interfaces or
//! structure may be changed around wildly between versions until a comfortable
//! final design is settled upon.</div>
//!
//! The crate is separated into:
//!
//! - [Pv], a cache of the latest value of a single PV, with a way to wait for new
//!   values as they arrive.
//! - [PvArray], which treats a list of PVs of the same type and length as a single
//!   array, tracking for each entry whether it has been seen and is currently valid.
//! - [SubscriptionSource](sources::SubscriptionSource), the trait that the caches use
//!   to subscribe to, read and write PVs. Anything that can deliver monitor updates
//!   can sit behind this.
//! - Representing the data delivered (["DBR" types]) in module [dbr].
//! - [sources::IntercomSource], a source serving PVs held in-process, driven through
//!   typed [Intercom](sources::intercom::Intercom) handles that can be cloned and
//!   passed across thread boundaries.
//!
//! Caches are owned by the caller. The background tasks delivering updates into them
//! only hold weak references, so dropping a cache stops its monitors.
//!
//! ## Example
//!
//! ```
//! # use std::time::Duration;
//! use epicars_pv::{Pv, PvArray, sources::IntercomSource};
//!
//! #[tokio::main]
//! async fn main() {
//!     let source = IntercomSource::new();
//!     let value = source.add_pv("NUMERIC_VALUE", 42i32).unwrap();
//!     let _other = source.add_pv("OTHER_VALUE", 1i32).unwrap();
//!
//!     let pv = Pv::connect(source.clone(), "NUMERIC_VALUE").await.unwrap();
//!     if let Some(current) = pv.get().await.unwrap() {
//!         println!("Value is: {}", current.value());
//!     }
//!
//!     pv.reset();
//!     value.store(43);
//!     // A disconnected PV would give None, and ok() would be false
//!     let next = pv.get_next(Duration::from_secs(1), false).await.unwrap();
//!     println!("Value is now: {:?} ok={}", next.map(|v| v.take_value()), pv.ok());
//!
//!     let array: PvArray<_, i32> = PvArray::connect(source, &["NUMERIC_VALUE", "OTHER_VALUE"])
//!         .await
//!         .unwrap();
//!     array.sync(Duration::from_secs(1), true).await.unwrap();
//!     println!("Array is: {:?} ok={}", array.get().as_slice(), array.all_ok());
//! }
//! ```
//!
//! ["DBR" types]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types

pub mod dbr;
pub mod event;
pub mod sources;
pub mod utils;

mod monitor;

mod pv;
pub use crate::pv::{Pv, PvBuilder, PvError, PvListener, PvState};

mod pv_array;
pub use crate::pv_array::{
    ArrayElement, ArrayListener, ArraySnapshot, ArrayState, PvArray, PvArrayBuilder,
};
