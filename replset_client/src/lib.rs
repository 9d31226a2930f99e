/*!
replset_client is the topology half of a client driver for a replicated document
database. It discovers which servers make up a cluster, classifies each of them, and
picks a server for every operation according to a [`ReadPreference`].

This library requires tokio and async, and uses the actor pattern. A single
[`Topology`] actor owns the cluster view and one monitor task per known server. The
[`Topology`] handle is cheap to clone and every clone talks to the same actor.

Selection always runs against one immutable [`TopologyDescription`] snapshot, so
background checks never expose a half-updated cluster to a caller.

# Example
```rust,no_run
# tokio_test::block_on(async {
use std::time::Duration;
use replset_client::{MaxStaleness, ReadMode, ReadPreference, TopologyBuilder};

let topology = TopologyBuilder::new()
    .set_hosts(&["db1.example.com:27017", "db2.example.com:27017"])
    .set_replica_set_name("rs0")
    .build()
    .unwrap();

let read_preference =
    ReadPreference::new(ReadMode::Secondary, MaxStaleness::Seconds(120), Vec::new()).unwrap();
let address = topology
    .select_server(&read_preference, Some(Duration::from_secs(5)))
    .await
    .unwrap();
println!("reading from {}", address);
# })
```

When the last [`Topology`] handle is dropped, the actor stops every monitor on its own.
*/

mod server_monitor;
mod topology;

pub mod events;
pub mod read_preference;
pub mod server_address;
pub mod server_description;
pub mod server_probe;
pub mod server_selector;
pub mod topology_conventions;
pub mod topology_description;

pub use events::TopologyEvent;
pub use read_preference::*;
pub use server_address::*;
pub use server_description::{ElectionId, HelloReply, ServerDescription, ServerRole};
pub use server_probe::{HealthCheck, HttpHealthCheck, ProbeError};
pub use server_selector::SelectionError;
pub use topology::*;
pub use topology_conventions::TopologyConventions;
pub use topology_description::{TopologyDescription, TopologyType, UpdateOutcome};

pub fn error_chain_fmt(
    e: &impl std::error::Error,
    f: &mut std::fmt::Formatter<'_>,
) -> std::fmt::Result {
    writeln!(f, "{}\n", e)?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by:\n\t{}", cause)?;
        current = cause.source();
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support;
