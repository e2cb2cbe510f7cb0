//! Download locations for the Apache projects we build from source.

/// The mirror used by default for Hadoop sources.
pub const HADOOP_APACHE_MIRROR: &str = "http://www.interior-dsgn.com/apache/";

/// The mirror used by default for Spark sources.
pub const SPARK_APACHE_MIRROR: &str = "http://mirror.metrocast.net/apache/";

pub const HADOOP_SRC_URL_TEMPLATE: &str = "hadoop/common/hadoop-VERSION/hadoop-VERSION-src.tar.gz";
pub const SPARK_SRC_URL_TEMPLATE: &str = "spark/spark-VERSION/spark-VERSION.tgz";

/// The URL of the given project tarball `template` for `version` on `mirror`.
pub fn tarball_url(mirror: &str, template: &str, version: &str) -> String {
    let mut url = mirror.to_owned();
    if !url.ends_with('/') {
        url.push('/');
    }
    url + &template.replace("VERSION", version)
}
