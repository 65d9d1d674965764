//! Stage and image signature computation: chains each stage's dependency
//! vector onto its predecessor's signature, and derives each image's
//! stable content signature from the result.

use kiln_hash::Digest256;
use kiln_types::Image;

/// The predecessor signature fed to an image's first stage. A fixed,
/// well-known digest rather than all-zero bytes, so an empty-vector stage
/// and "no predecessor yet" are never confusable by construction.
pub fn initial_predecessor() -> Digest256 {
    kiln_hash::hash(std::iter::empty::<&str>())
}

/// Sign every stage of `image` in order, chaining each stage's
/// [`kiln_types::DependencyVector`] onto the running predecessor signature.
/// Mutates `image.stages[..].signature` in place; does not touch
/// `artifact`, which is only ever set by a store lookup.
pub fn sign_image(image: &mut Image) {
    let mut predecessor = initial_predecessor();
    for stage in &mut image.stages {
        let parts: Vec<&str> = stage.dependency_vector.as_parts().iter().map(String::as_str).collect();
        let signature = kiln_hash::chain(&predecessor, parts);
        stage.signature = Some(signature);
        predecessor = signature;
    }
}
