#![forbid(unsafe_code)]

//! obskit public facade crate.
//!
//! Observable value holders, distinct holders and N-source merges, delivered
//! through a single-consumer dispatch queue.
//!
//! ```
//! use obskit::prelude::*;
//!
//! let main = MainLoop::new();
//! let d = main.dispatcher();
//! let width = Observable::new(&d, 4);
//! let height = Observable::new(&d, 3);
//! let area = merge2(&d, &width, &height, |w, h| w * h);
//!
//! let _sub = area.subscribe(|a| println!("area = {a}"));
//! main.run_until_idle();
//! assert_eq!(area.get(), Some(12));
//! ```

pub use obskit_core::{Error, Result};

pub mod prelude {
    pub use obskit_core as core;
    pub use obskit_runtime as runtime;

    pub use obskit_core::config::DispatchConfig;
    pub use obskit_core::dispatch::{DispatchThread, Dispatcher, MainLoop};
    pub use obskit_core::{Error, Result};
    pub use obskit_runtime::reactive::{
        Merged, Observable, ObservableList, Subscription, Suppression, merge_all, merge1, merge2,
        merge3,
    };
}
