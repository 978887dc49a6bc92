//! Fine-tune VGG16 for scene classification.
//!
//! Settings come from the JSON file named by `BOVW_SETTINGS`, defaults otherwise.
//! Set `RUST_LOG=info` to follow training.

use log::info;

use bovw::augment::ImageDataGenerator;
use bovw::finetune::{get_base_model, modify_model_for_classes, Loss, OnnxVgg16, Optimizer};
use bovw::plot::do_plotting;
use bovw::settings::create_results_dir;
use bovw::{BowResult, Settings};

fn main() -> BowResult<()> {
    pretty_env_logger::init();

    let settings = Settings::from_env()?;
    create_results_dir(&settings.results_dir)?;

    let backbone = OnnxVgg16::load(
        &settings.model_path,
        &settings.penultimate_output,
        settings.img_height as usize,
        settings.img_width as usize,
    )?;
    let base_model = get_base_model(backbone, &settings.results_dir)?;
    let mut model = modify_model_for_classes(base_model, settings.classes, &settings.results_dir)?;
    model.compile(Loss::CategoricalCrossentropy, Optimizer::adadelta());
    for layer in model.layers() {
        println!("{} {}", layer.name, layer.trainable);
    }

    let datagen = ImageDataGenerator::new(settings.generator_options()?);
    let target_size = settings.target_size();
    let batch_size = settings.batch_size;
    let seed = settings.seed;

    let mut train_generator =
        datagen.flow_from_directory(settings.train_dir(), target_size, batch_size, seed)?;
    let mut test_generator =
        datagen.flow_from_directory(settings.test_dir(), target_size, batch_size, seed)?;
    let mut validation_generator =
        datagen.flow_from_directory(settings.validation_dir(), target_size, batch_size, seed)?;

    let history = model.fit_generator(
        &mut train_generator,
        settings.steps_per_epoch,
        settings.epochs,
        &mut validation_generator,
        settings.validation_steps,
    )?;

    let result = model.evaluate_generator(&mut test_generator, settings.test_steps)?;
    info!("Test loss {:.4}, accuracy {:.4}", result[0], result[1]);
    println!("{:?}", result);

    if settings.plot_history {
        do_plotting(&history, &settings.results_dir)?;
    }
    Ok(())
}
