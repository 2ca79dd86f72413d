use rand::prelude::*;

use ripc_protocol::{Endpoint, EndpointSelection, InvocationMode};

/// Keeps the endpoints usable with `mode` and orders them by `selection`
/// and security preference.
///
/// Datagram modes keep only datagram endpoints and the others drop them.
/// A secure reference keeps only secure endpoints; otherwise secure ones go
/// first when `prefer_secure` is set and last when it is not. The ordering
/// within each group is preserved.
pub fn filter_endpoints(
    endpoints: Vec<Endpoint>,
    mode: InvocationMode,
    secure: bool,
    prefer_secure: bool,
    selection: EndpointSelection,
) -> Vec<Endpoint> {
    let mut endpoints: Vec<Endpoint> = endpoints
        .into_iter()
        .filter(|ep| ep.datagram() == mode.is_datagram())
        .collect();

    if selection == EndpointSelection::Random {
        endpoints.shuffle(&mut thread_rng());
    }

    if secure {
        endpoints.retain(|ep| ep.secure());
        return endpoints;
    }
    let (secured, plain): (Vec<Endpoint>, Vec<Endpoint>) =
        endpoints.into_iter().partition(|ep| ep.secure());
    if prefer_secure {
        secured.into_iter().chain(plain).collect()
    } else {
        plain.into_iter().chain(secured).collect()
    }
}
