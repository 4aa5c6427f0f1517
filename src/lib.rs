// src/lib.rs

#![doc = r#"
# Dropmirror

Dropmirror mirrors a directory tree from an origin machine to any number of
peers. Every mutation on the origin, whether made through the CRUD HTTP
interface or directly on disk, becomes a change event. Events are fanned out
over TCP to connected peers, which replay them onto their own copy of the tree.

```text
CRUD producer ─┐
               ├─> EventBus ─> ReplicationServer ══TCP══> ReplicationClient ─> ApplyEngine ─> disk
watch producer ┘
```

## Modules

- [`apply`]: Idempotent, root-contained application of events on a peer.
- [`bus`]: Publish/subscribe hub with a bounded queue per subscriber.
- [`client`]: Peer side of the replication stream.
- [`config`]: Configuration loading and merging from CLI, file, and environment.
- [`error`]: Domain error type.
- [`event`]: The change event model.
- [`http`]: CRUD interface on the origin's tree.
- [`paths`]: Root-relative path conversion and containment checks.
- [`producer`]: CRUD and filesystem-watch producers.
- [`server`]: Origin side of the replication stream.
- [`wire`]: Length-prefixed JSON frame codec.

Delivery is best effort and at-most-once: nothing is acknowledged, retried,
or replayed to peers that connect later.
"#]

pub mod apply;
pub mod bus;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod http;
pub mod paths;
pub mod producer;
pub mod server;
pub mod wire;
