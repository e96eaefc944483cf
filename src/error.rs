use crate::{
    config::ConfigError, engine::EngineError, formats::FormatError, job::JobError,
    otf::OtfError, report::ReportError,
};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Error in the `config` module")]
    Config(#[from] ConfigError),
    #[error("Error in the `formats` module")]
    Format(#[from] FormatError),
    #[error("Error in the `otf` module")]
    Otf(#[from] OtfError),
    #[error("Error in the `engine` module")]
    Engine(#[from] EngineError),
    #[error("Error in the `job` module")]
    Job(#[from] JobError),
    #[error("Error in the `report` module")]
    Report(#[from] ReportError),
}

/// Renders an error and its source chain on a single line, outermost first.
pub fn error_chain(error: &dyn std::error::Error) -> String {
    let mut text = error.to_string();
    let mut current = error.source();
    while let Some(cause) = current {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        current = cause.source();
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chains_render_outermost_first() {
        let inner = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let outer = FormatError::Io {
            path: "cell.dv".into(),
            source: inner,
        };
        let text = error_chain(&outer);
        assert!(text.starts_with("failed to access cell.dv"));
        assert!(text.ends_with("no such file"));
    }
}
