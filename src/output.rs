//! Writing JSON and JSONL output to a file or standard output.

use tokio::{
    fs::File,
    io::{AsyncWrite, AsyncWriteExt as _, BufWriter},
};

use crate::prelude::*;

/// Create an [`AsyncWrite`] for a file or stdout.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Writes one JSON record per line.
pub struct JsonlWriter {
    writer: BufWriter<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>>,
}

impl JsonlWriter {
    /// Write to `path`, or to standard output if `path` is `None`.
    pub async fn create(path: Option<&Path>) -> Result<Self> {
        Ok(Self {
            writer: BufWriter::new(create_writer(path).await?),
        })
    }

    /// Write a single record.
    pub async fn write_record<T: Serialize>(&mut self, record: &T) -> Result<()> {
        let mut json =
            serde_json::to_vec(record).context("Failed to serialize output record")?;
        json.push(b'\n');
        self.writer
            .write_all(&json)
            .await
            .context("Failed to write JSON to output")?;
        // Flush each record, so partial batches are visible if a later image
        // fails.
        self.writer.flush().await.context("Failed to flush output")
    }
}

/// Write a single pretty-printed JSON value to `path` or standard output.
pub async fn write_pretty_json<T: Serialize>(path: Option<&Path>, value: &T) -> Result<()> {
    let mut wtr = create_writer(path).await?;
    let mut json = serde_json::to_vec_pretty(value).context("failed to serialize output")?;
    json.push(b'\n');
    wtr.write_all(&json).await.context("failed to write output")?;
    wtr.flush().await.context("failed to flush output")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_one_record_per_line() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out.jsonl");
        let mut wtr = JsonlWriter::create(Some(&path)).await.unwrap();
        wtr.write_record(&serde_json::json!({ "a": 1 })).await.unwrap();
        wtr.write_record(&serde_json::json!({ "b": 2 })).await.unwrap();
        drop(wtr);

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "{\"a\":1}\n{\"b\":2}\n");
    }
}
