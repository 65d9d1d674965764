use kiln_types::{Image, KilnError};

use crate::{ConveyorContext, Phase};

/// Populates every stage's signature via `kiln-signature`. Signing is a
/// pure function over the whole ordered stage list at once, not
/// stage-by-stage independent work, so it runs once in
/// `before_image_stages`; `on_image_stage` is a no-op.
pub struct SignaturesPhase;

impl Phase for SignaturesPhase {
    fn name(&self) -> &str {
        "signatures"
    }

    fn before_image_stages(&self, _ctx: &ConveyorContext, image: &mut Image) -> Result<(), KilnError> {
        kiln_signature::sign_image(image);
        Ok(())
    }
}
