use tempfile::TempDir;
use ttt_mae::checkpoints::{load_base_checkpoint, save_model_state, ModelState, TensorData};
use ttt_mae::config::{Config, HeadType, ModelVariant};
use ttt_mae::model::{TestTimeModel, TinyMae};

fn small_config() -> Config {
    let mut config = Config::default();
    config.model.variant = ModelVariant::Small;
    config.model.input_size = 32;
    config.model.channels = 1;
    config.model.num_classes = 4;
    config.model.head_type = HeadType::Linear;
    config
}

/// Split a full state dict the way released checkpoints come: the
/// backbone in one file, the trained head in another.
fn split_state(state: &ModelState) -> (ModelState, ModelState) {
    let mut backbone = ModelState::new();
    let mut head = ModelState::new();
    for (name, tensor) in state {
        if name.starts_with("head.") || name.starts_with("classifier.") {
            head.insert(name.clone(), tensor.clone());
        } else {
            backbone.insert(name.clone(), tensor.clone());
        }
    }
    (backbone, head)
}

#[test]
fn split_checkpoints_merge_and_feed_a_model() {
    let dir = TempDir::new().unwrap();
    let config = small_config();

    let donor = TinyMae::new(&config.model, 3).unwrap();
    let full = donor.state_dict();
    let (mut backbone, head) = split_state(&full);
    // The backbone file ships a stale head that the merge must replace.
    for (name, tensor) in &head {
        backbone.insert(
            name.clone(),
            TensorData::new(vec![0.0; tensor.num_elements()], tensor.shape.clone()).unwrap(),
        );
    }

    let base_path = dir.path().join("base.safetensors");
    let head_path = dir.path().join("head.safetensors");
    save_model_state(&base_path, &backbone, None).unwrap();
    save_model_state(&head_path, &head, None).unwrap();

    let (merged, scale) =
        load_base_checkpoint(&base_path, Some(&head_path), &["classifier.", "head."]).unwrap();
    assert_eq!(scale, None);
    assert_eq!(merged, full);

    let mut model = TinyMae::new(&config.model, 9).unwrap();
    model.load_state_dict(&merged).unwrap();
    assert_eq!(model.state_dict(), full);
}

#[test]
fn stored_loss_scale_survives_the_merge() {
    let dir = TempDir::new().unwrap();
    let config = small_config();
    let state = TinyMae::new(&config.model, 1).unwrap().state_dict();

    let path = dir.path().join("base.safetensors");
    save_model_state(&path, &state, Some(3.0)).unwrap();

    let (loaded, scale) = load_base_checkpoint(&path, None, &["head."]).unwrap();
    assert_eq!(scale, Some(3.0));
    assert_eq!(loaded, state);
}

#[test]
fn incomplete_checkpoints_are_rejected_at_load() {
    let config = small_config();
    let mut state = TinyMae::new(&config.model, 1).unwrap().state_dict();
    state.remove("decoder.weight");

    let mut model = TinyMae::new(&config.model, 2).unwrap();
    let err = model.load_state_dict(&state).unwrap_err();
    assert!(err.to_string().contains("decoder.weight"));
}

#[test]
fn mismatched_geometry_is_rejected_at_load() {
    let config = small_config();
    let state = TinyMae::new(&config.model, 1).unwrap().state_dict();

    let mut wider = small_config();
    wider.model.num_classes = 7;
    let mut model = TinyMae::new(&wider.model, 2).unwrap();
    assert!(model.load_state_dict(&state).is_err());
}
