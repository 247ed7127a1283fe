mod headless;

use anyhow::Result;

pub(crate) struct Options {
    pub verbose: bool,
    pub color: bool,
}

pub(crate) trait Frontend {
    fn set_up(&mut self, options: &Options) -> Result<()>;
    fn tear_down(&mut self) -> Result<()>;
}

pub(crate) fn set_up(options: &Options) -> Result<Box<dyn Frontend>> {
    let mut logger = headless::HeadlessLogger {};
    logger.set_up(options)?;
    Ok(Box::new(logger))
}
