use crate::api::ModelInfo;

/// Sort models newest first, then by id for a stable listing.
pub fn sort_models(models: &mut [ModelInfo]) {
    models.sort_by(|a, b| match (&a.created, &b.created) {
        (Some(a_created), Some(b_created)) => b_created
            .cmp(a_created)
            .then_with(|| a.id.cmp(&b.id)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.id.cmp(&b.id),
    });
}
