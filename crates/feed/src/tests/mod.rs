mod feed_test;
