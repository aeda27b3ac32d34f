use serde::Serialize;
use sha2::{Digest, Sha256};
use shared::types::ServiceAddress;

#[derive(Serialize)]
struct HashView<'a> {
    service: &'a str,
    addresses: Vec<&'a ServiceAddress>,
}

/// SHA-256 of an availability view. Services and addresses are sorted
/// first, so two nodes holding the same view agree on the digest no matter
/// what order they learned it in.
pub fn compute_hash(view: &[(String, Vec<ServiceAddress>)]) -> Result<String, serde_json::Error> {
    let mut views: Vec<HashView<'_>> = view
        .iter()
        .filter(|(_, addresses)| !addresses.is_empty())
        .map(|(service, addresses)| {
            let mut addresses: Vec<&ServiceAddress> = addresses.iter().collect();
            addresses.sort();
            HashView { service, addresses }
        })
        .collect();
    views.sort_by(|a, b| a.service.cmp(b.service));

    let json = serde_json::to_vec(&views)?;
    Ok(hex::encode(Sha256::digest(&json)))
}
